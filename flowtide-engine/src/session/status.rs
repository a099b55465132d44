//! Progress and outcome of an import session.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use flowtide_core::reassembly::FlowState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Cancelled,
    /// The capture source failed; flows finalized before the failure are kept.
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Aborted => "aborted",
        }
    }

    pub fn is_finished(&self) -> bool {
        *self != SessionState::Running
    }
}

/// What an error is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "connection_id", rename_all = "snake_case")]
pub enum ErrorScope {
    Session,
    Flow(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub scope: ErrorScope,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCounts {
    pub opened: u64,
    /// Opened and not yet finalized.
    pub open: u64,
    pub closed: u64,
    pub corrupted: u64,
    pub persistence_failed: u64,
}

/// Point-in-time view of a session. Also the document persisted in the
/// `sessions` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(rename = "_id")]
    pub session_id: String,
    pub capture_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub frames_read: u64,
    pub frames_decoded: u64,
    pub frames_skipped: u64,
    pub frames_malformed: u64,
    /// Packets that matched no flow and could not open one.
    pub segments_dropped: u64,
    pub bytes_processed: u64,
    pub flows: FlowCounts,
    pub matches: u64,
    pub errors: Vec<SessionError>,
}

impl SessionStatus {
    pub fn flow_errors(&self) -> impl Iterator<Item = &SessionError> {
        self.errors
            .iter()
            .filter(|e| matches!(e.scope, ErrorScope::Flow(_)))
    }
}

/// Live counters shared by the driver and the workers.
#[derive(Debug)]
pub(crate) struct SessionCounters {
    session_id: String,
    capture_id: String,
    started_at: DateTime<Utc>,
    frames_read: AtomicU64,
    frames_decoded: AtomicU64,
    frames_skipped: AtomicU64,
    frames_malformed: AtomicU64,
    segments_dropped: AtomicU64,
    bytes_processed: AtomicU64,
    flows_opened: AtomicU64,
    flows_closed: AtomicU64,
    flows_corrupted: AtomicU64,
    persistence_failed: AtomicU64,
    matches: AtomicU64,
    outcome: Mutex<(SessionState, Option<DateTime<Utc>>)>,
    errors: Mutex<Vec<SessionError>>,
}

impl SessionCounters {
    pub fn new(session_id: String, capture_id: String) -> Self {
        Self {
            session_id,
            capture_id,
            started_at: Utc::now(),
            frames_read: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
            segments_dropped: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            flows_opened: AtomicU64::new(0),
            flows_closed: AtomicU64::new(0),
            flows_corrupted: AtomicU64::new(0),
            persistence_failed: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            outcome: Mutex::new((SessionState::Running, None)),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn frame_read(&self, bytes: usize) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segment_dropped(&self) {
        self.segments_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_opened(&self) {
        self.flows_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_finalized(&self, state: FlowState) {
        match state {
            FlowState::Corrupted => self.flows_corrupted.fetch_add(1, Ordering::Relaxed),
            _ => self.flows_closed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn persistence_failed(&self) {
        self.persistence_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matches_found(&self, count: usize) {
        self.matches.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, scope: ErrorScope, message: impl Into<String>) {
        self.errors.lock().push(SessionError {
            scope,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn finish(&self, state: SessionState) {
        *self.outcome.lock() = (state, Some(Utc::now()));
    }

    pub fn snapshot(&self) -> SessionStatus {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let opened = load(&self.flows_opened);
        let closed = load(&self.flows_closed);
        let corrupted = load(&self.flows_corrupted);
        let (state, finished_at) = *self.outcome.lock();
        SessionStatus {
            session_id: self.session_id.clone(),
            capture_id: self.capture_id.clone(),
            state,
            started_at: self.started_at,
            finished_at,
            frames_read: load(&self.frames_read),
            frames_decoded: load(&self.frames_decoded),
            frames_skipped: load(&self.frames_skipped),
            frames_malformed: load(&self.frames_malformed),
            segments_dropped: load(&self.segments_dropped),
            bytes_processed: load(&self.bytes_processed),
            flows: FlowCounts {
                opened,
                open: opened.saturating_sub(closed + corrupted),
                closed,
                corrupted,
                persistence_failed: load(&self.persistence_failed),
            },
            matches: load(&self.matches),
            errors: self.errors.lock().clone(),
        }
    }
}
