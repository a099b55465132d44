//! The persistable projection of a flow.
//!
//! [`ConnectionRecordBuilder`] is fed by the flow actor as reassembly and
//! matching progress. It hands out [`RecordSnapshot`]s: periodic partial
//! checkpoints for long-lived flows and one final snapshot, after which the
//! record refuses any further mutation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::flow::{Direction, DirectionClass, FlowKey};
use crate::ids;
use crate::reassembly::{CloseReason, DirectionStats, FlowState, GapRecord, StreamReassembler};
use crate::services::ServiceTable;
use crate::time::{to_datetime, NANOS_PER_MILLI};

/// A rule hit as reported by the matcher, before it is bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub rule_id: Arc<str>,
    pub rule_name: Arc<str>,
    pub direction: Direction,
    /// Stream offset of the first matched byte.
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    #[serde(rename = "_id")]
    pub id: String,
    pub connection_id: String,
    pub capture_id: String,
    #[serde(flatten)]
    pub key: FlowKey,
    pub rule_id: String,
    pub rule_name: String,
    pub direction: Direction,
    pub offset: u64,
    pub matched_text: String,
    pub matched_hex: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_ns: u64,
}

/// A contiguous run of delivered bytes for one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "_id")]
    pub id: String,
    pub connection_id: String,
    pub index: u64,
    pub direction: Direction,
    pub offset: u64,
    pub payload_hex: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_ns: u64,
}

impl StreamChunk {
    pub fn payload(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.payload_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub capture_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub key: FlowKey,
    pub classification: DirectionClass,
    pub service: Option<String>,
    pub state: FlowState,
    pub close_reason: Option<CloseReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub started_at_ns: u64,
    pub last_seen_ns: u64,
    pub duration_ms: Option<u64>,
    pub client_to_server: DirectionStats,
    pub server_to_client: DirectionStats,
    pub gaps: Vec<GapRecord>,
    pub match_ids: Vec<String>,
    pub rule_ids: Vec<String>,
    pub finalized: bool,
    pub persistence_failed: bool,
}

impl ConnectionRecord {
    pub fn stats(&self, direction: Direction) -> &DirectionStats {
        match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        }
    }
}

/// Everything a single persistence step has to write for one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub record: ConnectionRecord,
    pub matches: Vec<MatchResult>,
    pub chunks: Vec<StreamChunk>,
}

/// Identity of a new record.
#[derive(Debug, Clone)]
pub struct RecordOrigin {
    pub capture_id: String,
    pub session_id: String,
    pub key: FlowKey,
    pub classification: DirectionClass,
    /// Frame index of the flow's first segment.
    pub first_frame: u64,
    pub started_at_ns: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordOptions {
    pub chunk_size: usize,
    /// Capture-time interval between partial writes; zero disables them.
    pub checkpoint_interval_ns: u64,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            checkpoint_interval_ns: 30 * 1_000 * NANOS_PER_MILLI,
        }
    }
}

#[derive(Debug)]
struct OpenChunk {
    direction: Direction,
    offset: u64,
    timestamp_ns: u64,
    bytes: Vec<u8>,
}

impl OpenChunk {
    fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

#[derive(Debug)]
pub struct ConnectionRecordBuilder {
    record: ConnectionRecord,
    options: RecordOptions,
    last_checkpoint_ns: u64,
    open_chunk: Option<OpenChunk>,
    next_chunk_index: u64,
    pending_matches: Vec<MatchResult>,
    pending_chunks: Vec<StreamChunk>,
}

impl ConnectionRecordBuilder {
    pub fn new(origin: RecordOrigin, options: RecordOptions) -> Self {
        let id = ids::connection_id(&origin.capture_id, &origin.key, origin.first_frame);
        let record = ConnectionRecord {
            id,
            capture_id: origin.capture_id,
            session_id: origin.session_id,
            key: origin.key,
            classification: origin.classification,
            service: None,
            state: FlowState::Open,
            close_reason: None,
            started_at: to_datetime(origin.started_at_ns),
            ended_at: None,
            started_at_ns: origin.started_at_ns,
            last_seen_ns: origin.started_at_ns,
            duration_ms: None,
            client_to_server: DirectionStats::default(),
            server_to_client: DirectionStats::default(),
            gaps: Vec::new(),
            match_ids: Vec::new(),
            rule_ids: Vec::new(),
            finalized: false,
            persistence_failed: false,
        };
        Self {
            record,
            options,
            last_checkpoint_ns: origin.started_at_ns,
            open_chunk: None,
            next_chunk_index: 0,
            pending_matches: Vec::new(),
            pending_chunks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    pub fn is_finalized(&self) -> bool {
        self.record.finalized
    }

    /// Appends delivered bytes to the stream chunks. Consecutive contiguous
    /// data in one direction is merged up to the chunk size.
    pub fn on_flush(
        &mut self,
        direction: Direction,
        offset: u64,
        bytes: &[u8],
        timestamp_ns: u64,
    ) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.record.last_seen_ns = self.record.last_seen_ns.max(timestamp_ns);

        let continues = self
            .open_chunk
            .as_ref()
            .is_some_and(|c| c.direction == direction && c.end() == offset);
        if !continues {
            self.seal_chunk();
        }

        let mut offset = offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            let chunk = self.open_chunk.get_or_insert_with(|| OpenChunk {
                direction,
                offset,
                timestamp_ns,
                bytes: Vec::new(),
            });
            let room = self.options.chunk_size.max(1) - chunk.bytes.len();
            let take = room.min(rest.len());
            chunk.bytes.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            offset += take as u64;
            if chunk.bytes.len() >= self.options.chunk_size {
                self.seal_chunk();
            }
        }
        Ok(())
    }

    /// Binds a matcher hit to this connection. Returns the persisted form.
    pub fn on_match(&mut self, raw: RawMatch) -> Result<MatchResult, RecordError> {
        self.ensure_open()?;
        let id = ids::match_id(&self.record.id, &raw.rule_id, raw.direction, raw.offset);
        let result = MatchResult {
            id: id.clone(),
            connection_id: self.record.id.clone(),
            capture_id: self.record.capture_id.clone(),
            key: self.record.key,
            rule_id: raw.rule_id.to_string(),
            rule_name: raw.rule_name.to_string(),
            direction: raw.direction,
            offset: raw.offset,
            matched_text: String::from_utf8_lossy(&raw.bytes).into_owned(),
            matched_hex: hex::encode(&raw.bytes),
            timestamp: to_datetime(raw.timestamp_ns),
            timestamp_ns: raw.timestamp_ns,
        };

        if !self.record.match_ids.contains(&id) {
            self.record.match_ids.push(id);
            if !self.record.rule_ids.iter().any(|r| r.as_str() == &*raw.rule_id) {
                self.record.rule_ids.push(raw.rule_id.to_string());
            }
            self.pending_matches.push(result.clone());
        }
        Ok(result)
    }

    pub fn on_state(&mut self, state: FlowState) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.record.state = state;
        Ok(())
    }

    /// Copies counters, gaps and timestamps from the reassembler.
    pub fn observe(&mut self, reassembler: &StreamReassembler) -> Result<(), RecordError> {
        self.ensure_open()?;
        self.record.client_to_server = reassembler.stats(Direction::ClientToServer);
        self.record.server_to_client = reassembler.stats(Direction::ServerToClient);
        self.record.gaps = reassembler.gaps().to_vec();
        self.record.last_seen_ns = self.record.last_seen_ns.max(reassembler.last_seen_ns());
        self.record.state = reassembler.state();
        Ok(())
    }

    pub fn should_checkpoint(&self, now_ns: u64) -> bool {
        !self.record.finalized
            && self.options.checkpoint_interval_ns > 0
            && now_ns.saturating_sub(self.last_checkpoint_ns) >= self.options.checkpoint_interval_ns
    }

    /// Partial snapshot of a live flow, draining matches and chunks not yet
    /// handed out.
    pub fn checkpoint(&mut self, now_ns: u64) -> Result<RecordSnapshot, RecordError> {
        self.ensure_open()?;
        self.last_checkpoint_ns = now_ns;
        self.seal_chunk();
        Ok(self.snapshot())
    }

    pub fn finalize(
        &mut self,
        state: FlowState,
        reason: CloseReason,
        ended_at_ns: u64,
        services: &ServiceTable,
    ) -> Result<RecordSnapshot, RecordError> {
        self.ensure_open()?;
        self.seal_chunk();

        let ended_at_ns = ended_at_ns.max(self.record.started_at_ns);
        let record = &mut self.record;
        record.state = state;
        record.close_reason = Some(reason);
        record.last_seen_ns = record.last_seen_ns.max(ended_at_ns);
        record.ended_at = Some(to_datetime(ended_at_ns));
        record.duration_ms = Some((ended_at_ns - record.started_at_ns) / NANOS_PER_MILLI);
        record.service = services.lookup(record.key.server_port).map(str::to_owned);
        record.finalized = true;
        Ok(self.snapshot())
    }

    /// Flags the record after a write was given up on. This is delivery
    /// metadata and is accepted even once the record is finalized.
    pub fn mark_persistence_failed(&mut self) {
        self.record.persistence_failed = true;
    }

    /// Takes back the matches and chunks of a snapshot that could not be
    /// written, ahead of anything newer, so the next snapshot carries them.
    pub fn requeue(&mut self, snapshot: RecordSnapshot) {
        self.pending_matches.splice(0..0, snapshot.matches);
        self.pending_chunks.splice(0..0, snapshot.chunks);
    }

    fn snapshot(&mut self) -> RecordSnapshot {
        RecordSnapshot {
            record: self.record.clone(),
            matches: std::mem::take(&mut self.pending_matches),
            chunks: std::mem::take(&mut self.pending_chunks),
        }
    }

    fn seal_chunk(&mut self) {
        let Some(chunk) = self.open_chunk.take() else {
            return;
        };
        if chunk.bytes.is_empty() {
            return;
        }
        let index = self.next_chunk_index;
        self.next_chunk_index += 1;
        self.pending_chunks.push(StreamChunk {
            id: ids::chunk_id(&self.record.id, index),
            connection_id: self.record.id.clone(),
            index,
            direction: chunk.direction,
            offset: chunk.offset,
            payload_hex: hex::encode(&chunk.bytes),
            timestamp: to_datetime(chunk.timestamp_ns),
            timestamp_ns: chunk.timestamp_ns,
        });
    }

    fn ensure_open(&self) -> Result<(), RecordError> {
        if self.record.finalized {
            Err(RecordError::Finalized(self.record.id.clone()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NANOS_PER_SEC;

    fn origin() -> RecordOrigin {
        RecordOrigin {
            capture_id: "capture".into(),
            session_id: "session".into(),
            key: FlowKey::tcp(
                "10.0.0.1:5555".parse().unwrap(),
                "10.10.0.5:22".parse().unwrap(),
            ),
            classification: DirectionClass::Classified,
            first_frame: 0,
            started_at_ns: 10 * NANOS_PER_SEC,
        }
    }

    fn builder(chunk_size: usize) -> ConnectionRecordBuilder {
        ConnectionRecordBuilder::new(
            origin(),
            RecordOptions {
                chunk_size,
                checkpoint_interval_ns: 5 * NANOS_PER_SEC,
            },
        )
    }

    fn flag(offset: u64) -> RawMatch {
        RawMatch {
            rule_id: "flag".into(),
            rule_name: "flag".into(),
            direction: Direction::ServerToClient,
            offset,
            bytes: b"FLAG{deadbeef}".to_vec(),
            timestamp_ns: 11 * NANOS_PER_SEC,
        }
    }

    #[test]
    fn chunks_merge_per_direction() {
        let mut b = builder(8);
        b.on_flush(Direction::ClientToServer, 0, b"abc", 1).unwrap();
        b.on_flush(Direction::ClientToServer, 3, b"defghij", 2).unwrap();
        b.on_flush(Direction::ServerToClient, 0, b"ok", 3).unwrap();
        b.on_flush(Direction::ClientToServer, 10, b"k", 4).unwrap();

        let snap = b.checkpoint(20 * NANOS_PER_SEC).unwrap();
        let chunks: Vec<_> = snap
            .chunks
            .iter()
            .map(|c| (c.index, c.direction, c.offset, c.payload().unwrap()))
            .collect();
        assert_eq!(
            chunks,
            vec![
                (0, Direction::ClientToServer, 0, b"abcdefgh".to_vec()),
                (1, Direction::ClientToServer, 8, b"ij".to_vec()),
                (2, Direction::ServerToClient, 0, b"ok".to_vec()),
                (3, Direction::ClientToServer, 10, b"k".to_vec()),
            ]
        );
        assert!(b.checkpoint(21 * NANOS_PER_SEC).unwrap().chunks.is_empty());
    }

    #[test]
    fn matches_are_recorded_once() {
        let mut b = builder(1024);
        let first = b.on_match(flag(4)).unwrap();
        assert_eq!(first.matched_text, "FLAG{deadbeef}");
        assert_eq!(first.connection_id, b.id());
        b.on_match(flag(4)).unwrap();
        b.on_match(flag(40)).unwrap();

        assert_eq!(b.record().match_ids.len(), 2);
        assert_eq!(b.record().rule_ids, vec!["flag".to_string()]);
        let snap = b.checkpoint(11 * NANOS_PER_SEC).unwrap();
        assert_eq!(snap.matches.len(), 2);
    }

    #[test]
    fn unwritten_checkpoint_is_carried_into_the_final_snapshot() {
        let mut b = builder(1024);
        b.on_flush(Direction::ServerToClient, 0, b"FLAG{deadbeef}", 1).unwrap();
        b.on_match(flag(0)).unwrap();
        let lost = b.checkpoint(16 * NANOS_PER_SEC).unwrap();
        assert_eq!((lost.matches.len(), lost.chunks.len()), (1, 1));
        b.requeue(lost);

        b.on_flush(Direction::ServerToClient, 14, b"\r\n", 2).unwrap();
        let services = ServiceTable::new([(22, "ssh")]);
        let last = b
            .finalize(FlowState::Closed, CloseReason::Fin, 17 * NANOS_PER_SEC, &services)
            .unwrap();
        assert_eq!(last.matches.len(), 1);
        assert_eq!(last.matches[0].id, last.record.match_ids[0]);
        let chunks: Vec<_> = last.chunks.iter().map(|c| (c.index, c.offset)).collect();
        assert_eq!(chunks, [(0, 0), (1, 14)]);
    }

    #[test]
    fn checkpoint_cadence_follows_capture_time() {
        let b = builder(1024);
        assert!(!b.should_checkpoint(12 * NANOS_PER_SEC));
        assert!(b.should_checkpoint(15 * NANOS_PER_SEC));
    }

    #[test]
    fn finalized_record_is_immutable() {
        let mut b = builder(1024);
        b.on_flush(Direction::ClientToServer, 0, b"SSH-2.0", 1).unwrap();
        let services = ServiceTable::new([(22, "ssh")]);
        let snap = b
            .finalize(FlowState::Closed, CloseReason::Fin, 12 * NANOS_PER_SEC, &services)
            .unwrap();

        assert!(snap.record.finalized);
        assert_eq!(snap.record.service.as_deref(), Some("ssh"));
        assert_eq!(snap.record.duration_ms, Some(2_000));
        assert_eq!(snap.chunks.len(), 1);

        let err = b.on_flush(Direction::ClientToServer, 7, b"x", 2).unwrap_err();
        assert_eq!(err, RecordError::Finalized(b.id().to_string()));
        assert!(b.on_match(flag(0)).is_err());
        assert!(b.on_state(FlowState::Open).is_err());
        assert!(b
            .finalize(FlowState::Closed, CloseReason::Fin, 0, &services)
            .is_err());

        b.mark_persistence_failed();
        assert!(b.record().persistence_failed);
    }

    #[test]
    fn record_serializes_with_flat_key() {
        let b = builder(1024);
        let value = serde_json::to_value(b.record()).unwrap();
        assert_eq!(value["_id"], b.id());
        assert_eq!(value["server_port"], 22);
        assert_eq!(value["client_ip"], "10.0.0.1");
        assert_eq!(value["state"], "open");
        let back: ConnectionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(&back, b.record());
    }
}
