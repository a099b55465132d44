//! ## flowtide-core::events
//! **Fire-and-forget notifications for subscribers outside the pipeline**
//!
//! Publishing never blocks and never fails the caller: a sink with no
//! listeners, or listeners that fell behind, simply loses events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::reassembly::{CloseReason, FlowState};
use crate::record::MatchResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    RuleMatched(MatchResult),
    ConnectionFinalized {
        connection_id: String,
        state: FlowState,
        close_reason: CloseReason,
        match_count: usize,
    },
    SessionFinished {
        session_id: String,
        status: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::RuleMatched(_) => "rule_matched",
            Notification::ConnectionFinalized { .. } => "connection_finalized",
            Notification::SessionFinished { .. } => "session_finished",
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Fan-out over a bounded broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn publish(&self, notification: Notification) {
        let kind = notification.kind();
        if self.sender.send(notification).is_err() {
            trace!(kind, "No subscribers for notification");
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn publish(&self, _notification: Notification) {}
}
