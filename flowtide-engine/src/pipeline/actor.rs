//! ## flowtide-engine::pipeline::actor
//! **One flow key, one actor, one mailbox**
//!
//! A [`FlowSlot`] is drained by at most one worker at a time, so the actor's
//! reassembler, matcher and record builder are never shared. An actor may
//! run several connections in sequence: once a connection is finalized, the
//! next segment able to open one starts a new connection with its own id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::SegQueue;
use flowtide_core::events::Notification;
use flowtide_core::flow::{Direction, DirectionClass, FlowKey, Segment};
use flowtide_core::reassembly::{CloseReason, FlowState, ReassemblyEvent, StreamReassembler};
use flowtide_core::record::{ConnectionRecordBuilder, MatchResult, RecordOrigin};
use flowtide_core::RecordError;
use flowtide_detection::{RuleMatcher, RuleScope};
use flowtide_telemetry::EventLogger;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::{debug, info, trace, warn};

use crate::session::status::ErrorScope;
use crate::session::SessionShared;

#[derive(Debug)]
pub(crate) enum Work {
    Segment(Segment),
    Close(CloseReason),
}

/// Work plus the in-flight permit released once it is fully handled.
pub(crate) struct WorkItem {
    pub work: Work,
    pub permit: OwnedSemaphorePermit,
}

pub(crate) struct FlowSlot {
    key: FlowKey,
    mailbox: SegQueue<WorkItem>,
    scheduled: AtomicBool,
    actor: Mutex<FlowActor>,
}

impl FlowSlot {
    pub fn new(key: FlowKey, classification: DirectionClass, shared: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self {
            key,
            mailbox: SegQueue::new(),
            scheduled: AtomicBool::new(false),
            actor: Mutex::new(FlowActor::new(key, classification, shared)),
        })
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Queues work. Returns `true` when the slot was idle and the caller
    /// must hand it to a worker.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        self.mailbox.push(item);
        self.scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Handles queued work until the mailbox stays empty.
    pub async fn drain(&self) {
        let mut actor = self.actor.lock().await;
        loop {
            while let Some(WorkItem { work, permit }) = self.mailbox.pop() {
                actor.handle(work).await;
                drop(permit);
            }
            self.scheduled.store(false, Ordering::SeqCst);
            // Work pushed after the last pop but before the flag was cleared
            // found the slot scheduled and did not reschedule it.
            if self.mailbox.is_empty()
                || self
                    .scheduled
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                break;
            }
        }
    }
}

struct Connection {
    reassembler: StreamReassembler,
    matcher: RuleMatcher,
    builder: ConnectionRecordBuilder,
}

impl Connection {
    fn id(&self) -> &str {
        self.builder.id()
    }

    /// Routes reassembly output through the matcher into the record.
    fn apply(
        &mut self,
        events: Vec<ReassemblyEvent>,
        shared: &SessionShared,
    ) -> Result<Vec<MatchResult>, RecordError> {
        let metrics = &shared.context.metrics;
        let mut found = Vec::new();
        for event in events {
            match event {
                ReassemblyEvent::Data {
                    direction,
                    offset,
                    bytes,
                    timestamp_ns,
                } => {
                    self.builder.on_flush(direction, offset, &bytes, timestamp_ns)?;
                    metrics.payload_bytes.inc_by(bytes.len() as u64);
                    let started = Instant::now();
                    let hits = self.matcher.feed(direction, offset, &bytes, timestamp_ns);
                    metrics.scan_latency.observe(started.elapsed().as_nanos() as f64);
                    for hit in hits {
                        found.push(self.builder.on_match(hit)?);
                    }
                }
                ReassemblyEvent::Gap(gap) => {
                    debug!(
                        connection_id = self.builder.id(),
                        direction = gap.direction.as_str(),
                        offset = gap.offset,
                        length = gap.length,
                        "Gap declared"
                    );
                }
                ReassemblyEvent::Finished { direction } => {
                    let hits = self.matcher.finish(direction, self.reassembler.last_seen_ns());
                    for hit in hits {
                        found.push(self.builder.on_match(hit)?);
                    }
                }
                ReassemblyEvent::StateChanged { from, to } => {
                    trace!(
                        connection_id = self.builder.id(),
                        from = from.as_str(),
                        to = to.as_str(),
                        "Flow state changed"
                    );
                    self.builder.on_state(to)?;
                }
            }
        }
        self.builder.observe(&self.reassembler)?;
        Ok(found)
    }
}

pub(crate) struct FlowActor {
    key: FlowKey,
    classification: DirectionClass,
    scope: RuleScope,
    shared: Arc<SessionShared>,
    current: Option<Connection>,
}

impl FlowActor {
    fn new(key: FlowKey, classification: DirectionClass, shared: Arc<SessionShared>) -> Self {
        let scope = RuleScope::new(key.server_port, shared.context.services.lookup(key.server_port));
        Self {
            key,
            classification,
            scope,
            shared,
            current: None,
        }
    }

    async fn handle(&mut self, work: Work) {
        let result = match work {
            Work::Segment(segment) => self.on_segment(segment).await,
            Work::Close(reason) => self.close(reason).await,
        };
        if let Err(e) = result {
            let id = self.current.take().map(|c| c.id().to_string());
            warn!(key = %self.key, error = %e, "Flow abandoned");
            let scope = id.map(ErrorScope::Flow).unwrap_or(ErrorScope::Session);
            self.shared.counters.record_error(scope, e.to_string());
        }
    }

    async fn on_segment(&mut self, segment: Segment) -> Result<(), RecordError> {
        if self.current.is_none() {
            if !segment.can_open_flow() {
                trace!(key = %self.key, "Segment after close dropped");
                self.shared.counters.segment_dropped();
                return Ok(());
            }
            self.current = Some(self.open(&segment));
        }
        let Some(connection) = self.current.as_mut() else {
            return Ok(());
        };

        let events = match connection.reassembler.on_segment(&segment) {
            Ok(events) => events,
            Err(e) => {
                debug!(connection_id = connection.id(), error = %e, "Segment rejected");
                self.shared.counters.segment_dropped();
                return Ok(());
            }
        };
        let found = connection.apply(events, &self.shared)?;
        self.publish_matches(found);

        let Some(connection) = self.current.as_mut() else {
            return Ok(());
        };
        if connection.reassembler.is_closed() {
            let reason = connection.reassembler.close_reason().unwrap_or(CloseReason::Fin);
            return self.finalize(reason).await;
        }

        let now = segment.timestamp_ns;
        if connection.builder.should_checkpoint(now) {
            let snapshot = connection.builder.checkpoint(now)?;
            if let Err(e) = self.shared.persister.persist_partial(&snapshot).await {
                warn!(connection_id = %snapshot.record.id, error = %e, "Partial write failed, deferred to the next write");
                self.shared.counters.record_error(
                    ErrorScope::Flow(snapshot.record.id.clone()),
                    format!("partial write failed: {e}"),
                );
                connection.builder.requeue(snapshot);
            }
        }
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), RecordError> {
        let Some(connection) = self.current.as_mut() else {
            return Ok(());
        };
        let events = connection.reassembler.close(reason);
        let found = connection.apply(events, &self.shared)?;
        self.publish_matches(found);
        self.finalize(reason).await
    }

    fn open(&self, segment: &Segment) -> Connection {
        let shared = &self.shared;
        let origin = RecordOrigin {
            capture_id: shared.capture_id.clone(),
            session_id: shared.session_id.clone(),
            key: self.key,
            classification: self.classification,
            first_frame: segment.frame_index,
            started_at_ns: segment.timestamp_ns,
        };
        let connection = Connection {
            reassembler: StreamReassembler::new(shared.limits),
            matcher: RuleMatcher::new(Arc::clone(&shared.context.rules), &self.scope),
            builder: ConnectionRecordBuilder::new(origin, shared.record_options),
        };
        shared.counters.flow_opened();
        shared.context.metrics.flows_opened.inc();
        debug!(
            connection_id = connection.id(),
            key = %self.key,
            classification = ?self.classification,
            "Flow opened"
        );
        connection
    }

    async fn finalize(&mut self, reason: CloseReason) -> Result<(), RecordError> {
        let Some(mut connection) = self.current.take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let ended_at = connection.reassembler.last_seen_ns();

        let mut found = Vec::new();
        for direction in Direction::BOTH {
            for hit in connection.matcher.finish(direction, ended_at) {
                found.push(connection.builder.on_match(hit)?);
            }
        }
        self.publish_matches(found);

        connection.builder.observe(&connection.reassembler)?;
        let state = match connection.reassembler.state() {
            FlowState::Corrupted => FlowState::Corrupted,
            _ => FlowState::Closed,
        };
        let snapshot =
            connection
                .builder
                .finalize(state, reason, ended_at, &shared.context.services)?;
        let id = snapshot.record.id.clone();

        if let Err(e) = shared.persister.persist_final(&snapshot).await {
            warn!(connection_id = %id, error = %e, "Final write abandoned");
            connection.builder.mark_persistence_failed();
            shared.counters.persistence_failed();
            shared
                .counters
                .record_error(ErrorScope::Flow(id.clone()), format!("final write abandoned: {e}"));
            if let Err(e) = shared.persister.flag_failed(&id).await {
                debug!(connection_id = %id, error = %e, "Could not flag failed record");
            }
        }

        shared.counters.flow_finalized(state);
        shared.context.metrics.flows_finalized.inc();
        if state == FlowState::Corrupted {
            shared.context.metrics.flows_corrupted.inc();
        }
        info!(
            connection_id = %id,
            key = %self.key,
            state = state.as_str(),
            reason = ?reason,
            matches = snapshot.record.match_ids.len(),
            "Flow finalized"
        );
        shared.context.notifier.publish(Notification::ConnectionFinalized {
            connection_id: id,
            state,
            close_reason: reason,
            match_count: snapshot.record.match_ids.len(),
        });
        Ok(())
    }

    fn publish_matches(&self, found: Vec<MatchResult>) {
        if found.is_empty() {
            return;
        }
        let shared = &self.shared;
        shared.counters.matches_found(found.len());
        shared.context.metrics.matches.inc_by(found.len() as u64);
        for result in found {
            EventLogger::log_event("rule_matched", &result.connection_id, &result.rule_id);
            shared.context.notifier.publish(Notification::RuleMatched(result));
        }
    }
}
