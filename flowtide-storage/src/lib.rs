//! Storage
//!
//! This crate defines the `Storage` trait through which the pipeline
//! persists documents, the filter language shared by writers and downstream
//! readers, and an in-memory engine implementing it.
//!
//! Documents are JSON objects keyed by their `_id` field. Writers rely on
//! deterministic ids, so every write is an upsert.

pub mod collection;
pub mod documents;
pub mod error;
pub mod filter;
pub mod memory;
pub mod query;

use async_trait::async_trait;
use serde_json::Value;

pub use collection::Collection;
pub use error::StorageError;
pub use filter::{Condition, Filter};
pub use memory::MemoryStorage;
pub use query::{stream_chunks, ConnectionQuery, MatchQuery};

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored document was already identical.
    Unchanged,
}

/// Document storage backend.
///
/// Implementations must be safe to call from many flow workers at once.
#[async_trait]
pub trait Storage: Send + Sync {
    /// All documents of `collection` matching `filter`, ordered by id.
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StorageError>;

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Value>, StorageError>;

    /// Inserts `document`, or replaces the stored document with the same
    /// `_id`.
    async fn upsert(&self, collection: Collection, document: Value) -> Result<UpsertOutcome, StorageError>;

    /// Sets the fields of `changes` on every matching document. Returns the
    /// number of documents modified.
    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        changes: Value,
    ) -> Result<usize, StorageError>;
}
