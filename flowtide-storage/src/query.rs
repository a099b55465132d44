//! Query builders for downstream readers of persisted connections.

use flowtide_core::flow::FlowKey;
use flowtide_core::reassembly::FlowState;
use flowtide_core::record::{ConnectionRecord, MatchResult, StreamChunk};
use serde_json::Value;

use crate::collection::Collection;
use crate::documents;
use crate::error::StorageError;
use crate::filter::Filter;
use crate::Storage;

#[derive(Debug, Clone, Default)]
pub struct ConnectionQuery {
    filter: Filter,
}

impl ConnectionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections between exactly these endpoints, in this orientation.
    pub fn flow(mut self, key: &FlowKey) -> Self {
        self.filter = self
            .filter
            .eq("client_ip", key.client_ip.to_string())
            .eq("client_port", key.client_port)
            .eq("server_ip", key.server_ip.to_string())
            .eq("server_port", key.server_port);
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.filter = self.filter.eq("server_port", port);
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.filter = self.filter.eq("service", service.into());
        self
    }

    /// Connections that started within `[from_ns, to_ns]` capture time.
    pub fn started_between(mut self, from_ns: u64, to_ns: u64) -> Self {
        self.filter = self
            .filter
            .gte("started_at_ns", from_ns)
            .lte("started_at_ns", to_ns);
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.filter = self.filter.contains("rule_ids", rule_id.into());
        self
    }

    pub fn capture(mut self, capture_id: impl Into<String>) -> Self {
        self.filter = self.filter.eq("capture_id", capture_id.into());
        self
    }

    pub fn state(mut self, state: FlowState) -> Self {
        self.filter = self.filter.eq("state", state.as_str());
        self
    }

    pub fn finalized(mut self) -> Self {
        self.filter = self.filter.eq("finalized", Value::Bool(true));
        self
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub async fn run(&self, storage: &dyn Storage) -> Result<Vec<ConnectionRecord>, StorageError> {
        documents::list(storage, Collection::Connections, &self.filter).await
    }
}

/// Matches and stream chunks belonging to connections.
#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    filter: Filter,
}

impl MatchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.filter = self.filter.eq("connection_id", connection_id.into());
        self
    }

    pub fn rule(mut self, rule_id: impl Into<String>) -> Self {
        self.filter = self.filter.eq("rule_id", rule_id.into());
        self
    }

    pub async fn run(&self, storage: &dyn Storage) -> Result<Vec<MatchResult>, StorageError> {
        documents::list(storage, Collection::Matches, &self.filter).await
    }
}

/// Delivered bytes of one connection, ordered by chunk index.
pub async fn stream_chunks(
    storage: &dyn Storage,
    connection_id: &str,
) -> Result<Vec<StreamChunk>, StorageError> {
    let filter = Filter::all().eq("connection_id", connection_id);
    let mut chunks: Vec<StreamChunk> =
        documents::list(storage, Collection::ConnectionStreams, &filter).await?;
    chunks.sort_by_key(|c| c.index);
    Ok(chunks)
}
