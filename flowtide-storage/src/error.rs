use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Document has no string _id")]
    MissingId,
    #[error("Expected a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}
