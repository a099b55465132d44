use flowtide_capture::CaptureError;
use flowtide_config::ConfigError;
use flowtide_detection::DetectionError;
use flowtide_storage::StorageError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Application is not configured")]
    NotConfigured,

    #[error("Application is already configured; use reconfigure")]
    AlreadyConfigured,

    #[error("Server address and flag regex are both required")]
    IncompleteSettings,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rule error: {0}")]
    Rules(#[from] DetectionError),

    #[error("Rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Metrics registry error: {0}")]
    Metrics(String),

    #[error("Unknown session {0}")]
    UnknownSession(String),

    #[error("Capture {0} is already being imported")]
    AlreadyImporting(String),

    #[error("Worker pool stopped")]
    PoolStopped,

    #[error("Session task failed: {0}")]
    SessionJoin(String),
}

impl From<JoinError> for EngineError {
    fn from(err: JoinError) -> Self {
        EngineError::SessionJoin(err.to_string())
    }
}
