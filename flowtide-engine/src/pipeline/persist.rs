//! Idempotent, retried writes of connection snapshots.
//!
//! Every document carries a deterministic id, so a retried or repeated write
//! upserts the same document. A partial snapshot never replaces a record that
//! was already written as finalized.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flowtide_config::PersistenceConfig;
use flowtide_core::record::RecordSnapshot;
use flowtide_storage::{Collection, Filter, Storage, StorageError, UpsertOutcome};
use flowtide_telemetry::PipelineMetrics;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Exponential backoff with jitter for storage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): the doubled backoff,
    /// capped, with its upper half randomised.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .min(self.max_backoff);
        let half = base.as_millis() as u64 / 2;
        let jitter = rand::rng().random_range(0..=half);
        Duration::from_millis(half + jitter)
    }
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[derive(Clone)]
pub struct Persister {
    storage: Arc<dyn Storage>,
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl Persister {
    pub fn new(storage: Arc<dyn Storage>, policy: RetryPolicy, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            storage,
            policy,
            metrics,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Writes chunks, then matches, then the record itself, so a stored
    /// record never references documents that are missing.
    pub async fn persist_final(&self, snapshot: &RecordSnapshot) -> Result<(), StorageError> {
        self.persist_children(snapshot).await?;
        self.put(Collection::Connections, &snapshot.record).await?;
        Ok(())
    }

    /// Checkpoint of a live flow. Returns `false` when the stored record is
    /// already finalized and was left untouched.
    pub async fn persist_partial(&self, snapshot: &RecordSnapshot) -> Result<bool, StorageError> {
        self.persist_children(snapshot).await?;
        let filter = Filter::by_id(snapshot.record.id.as_str());
        let (storage, filter) = (&self.storage, &filter);
        let existing = self
            .with_retry("find connection", move || {
                storage.find_one(Collection::Connections, filter)
            })
            .await?;
        let finalized = existing
            .as_ref()
            .and_then(|doc| doc.get("finalized"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if finalized {
            debug!(connection_id = %snapshot.record.id, "Partial write skipped, record already final");
            return Ok(false);
        }
        self.put(Collection::Connections, &snapshot.record).await?;
        Ok(true)
    }

    /// Single attempt at flagging a record whose final write was abandoned.
    pub async fn flag_failed(&self, connection_id: &str) -> Result<usize, StorageError> {
        self.storage
            .update(
                Collection::Connections,
                &Filter::by_id(connection_id),
                serde_json::json!({ "persistence_failed": true }),
            )
            .await
    }

    pub async fn put<T: Serialize + ?Sized>(
        &self,
        collection: Collection,
        document: &T,
    ) -> Result<UpsertOutcome, StorageError> {
        let value = serde_json::to_value(document)?;
        let storage = &self.storage;
        self.with_retry(collection.as_str(), move || {
            storage.upsert(collection, value.clone())
        })
        .await
    }

    async fn persist_children(&self, snapshot: &RecordSnapshot) -> Result<(), StorageError> {
        for chunk in &snapshot.chunks {
            self.put(Collection::ConnectionStreams, chunk).await?;
        }
        for found in &snapshot.matches {
            self.put(Collection::Matches, found).await?;
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay(attempt);
                    warn!(what, attempt, ?delay, error = %e, "Storage write failed, retrying");
                    self.metrics.persistence_retries.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.persistence_failures.inc();
                    return Err(e);
                }
            }
        }
    }
}
