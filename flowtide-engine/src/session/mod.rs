//! ## flowtide-engine::session
//! **One import run, from capture source to persisted records**
//!
//! Task layout of a session:
//! - a blocking reader pulling frames into a bounded channel
//! - one driver decoding frames and routing them in capture order
//! - a worker pool draining per-flow mailboxes
//!
//! Errors of a single flow never stop the session. A failing capture source
//! aborts it, after every flow seen so far has been finalized.

pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowtide_capture::{decode, CaptureError, Decoded, Frame, PacketSource};
use flowtide_core::events::Notification;
use flowtide_core::reassembly::{CloseReason, ReassemblyLimits};
use flowtide_core::record::RecordOptions;
use flowtide_core::time::NANOS_PER_MILLI;
use flowtide_storage::Collection;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};
use uuid::Uuid;

use crate::context::PipelineContext;
use crate::error::EngineError;
use crate::pipeline::actor::{FlowSlot, Work};
use crate::pipeline::demux::{FlowDemultiplexer, Routed};
use crate::pipeline::persist::Persister;
use crate::pipeline::pool::WorkerPool;

use self::status::{ErrorScope, SessionCounters, SessionState, SessionStatus};

/// State shared by the driver, the workers and every flow actor of a session.
pub(crate) struct SessionShared {
    pub session_id: String,
    pub capture_id: String,
    pub context: Arc<PipelineContext>,
    pub persister: Persister,
    pub counters: SessionCounters,
    pub limits: ReassemblyLimits,
    pub record_options: RecordOptions,
}

impl SessionShared {
    fn new(session_id: String, capture_id: String, context: Arc<PipelineContext>) -> Self {
        Self {
            counters: SessionCounters::new(session_id.clone(), capture_id.clone()),
            persister: context.persister(),
            limits: context.reassembly_limits(),
            record_options: context.record_options(),
            session_id,
            capture_id,
            context,
        }
    }
}

/// Cooperative cancellation observed by the reader and the driver.
#[derive(Debug, Default)]
pub(crate) struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

enum SourceEvent {
    Frame(Frame),
    Failed(CaptureError),
}

/// Entry point for running an import.
pub struct ImportSession;

impl ImportSession {
    /// Spawns the pipeline for `source` on the current tokio runtime and
    /// returns at once.
    #[instrument(level = "info", skip_all, fields(capture_id = %source.capture_id()))]
    pub fn start<S>(context: Arc<PipelineContext>, source: S) -> SessionHandle
    where
        S: PacketSource + 'static,
    {
        let session_id = Uuid::new_v4().to_string();
        let capture_id = source.capture_id().to_string();
        let shared = Arc::new(SessionShared::new(session_id.clone(), capture_id, context));
        let cancel = Arc::new(CancelSignal::default());
        let (done_tx, done_rx) = watch::channel(false);

        info!(%session_id, "Import session starting");
        tokio::spawn(
            run(Arc::clone(&shared), source, Arc::clone(&cancel), done_tx)
                .instrument(info_span!("import_session", %session_id)),
        );

        SessionHandle {
            shared,
            cancel,
            done: done_rx,
        }
    }
}

/// Control surface of a running or finished session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    cancel: Arc<CancelSignal>,
    done: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn capture_id(&self) -> &str {
        &self.shared.capture_id
    }

    /// Stops feeding frames; flows in progress are finalized as cancelled.
    pub fn cancel(&self) {
        info!(session_id = %self.shared.session_id, "Cancellation requested");
        self.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Waits for the session to end and returns its final status.
    pub async fn wait(&self) -> Result<SessionStatus, EngineError> {
        let mut done = self.done.clone();
        done.wait_for(|finished| *finished)
            .await
            .map_err(|_| EngineError::SessionJoin("session task ended without reporting".into()))?;
        Ok(self.status())
    }
}

async fn run<S: PacketSource + 'static>(
    shared: Arc<SessionShared>,
    source: S,
    cancel: Arc<CancelSignal>,
    done: watch::Sender<bool>,
) {
    let settings = shared.context.config.session.clone();
    persist_summary(&shared).await;

    let (frames_tx, frames_rx) = mpsc::channel(settings.frame_queue.max(1));
    let reader = spawn_blocking({
        let cancel = Arc::clone(&cancel);
        move || read_frames(source, frames_tx, &cancel)
    });
    let pool = WorkerPool::spawn(settings.workers, settings.max_in_flight);

    let state = drive(&shared, frames_rx, &pool, &cancel).await;

    for failure in pool.shutdown().await {
        error!(error = %failure, "Flow worker failed");
        shared
            .counters
            .record_error(ErrorScope::Session, format!("flow worker failed: {failure}"));
    }
    if let Err(e) = reader.await {
        error!(error = %e, "Capture reader failed");
        shared
            .counters
            .record_error(ErrorScope::Session, format!("capture reader failed: {e}"));
    }

    shared.counters.finish(state);
    persist_summary(&shared).await;
    let status = shared.counters.snapshot();
    info!(
        state = state.as_str(),
        frames = status.frames_read,
        flows = status.flows.opened,
        matches = status.matches,
        errors = status.errors.len(),
        "Import session finished"
    );
    shared.context.notifier.publish(Notification::SessionFinished {
        session_id: shared.session_id.clone(),
        status: state.as_str().to_string(),
    });
    let _ = done.send(true);
}

/// Runs on a blocking thread. Ends at end of capture, on the first source
/// error, on cancellation, or when the driver stops listening.
fn read_frames<S: PacketSource>(mut source: S, frames: mpsc::Sender<SourceEvent>, cancel: &CancelSignal) {
    while !cancel.is_cancelled() {
        let event = match source.next_frame() {
            Ok(Some(frame)) => SourceEvent::Frame(frame),
            Ok(None) => break,
            Err(e) => SourceEvent::Failed(e),
        };
        let failed = matches!(event, SourceEvent::Failed(_));
        if frames.blocking_send(event).is_err() || failed {
            break;
        }
    }
    debug!("Capture reader stopped");
}

/// Decodes and routes frames in capture order. Returns the final session
/// state once every flow has been handed its close.
async fn drive(
    shared: &Arc<SessionShared>,
    mut frames: mpsc::Receiver<SourceEvent>,
    pool: &WorkerPool,
    cancel: &CancelSignal,
) -> SessionState {
    let context = &shared.context;
    let counters = &shared.counters;
    let mut demux = FlowDemultiplexer::new(context.server_network, context.idle_timeout_ns());
    let sweep_every_ns = context.config.session.sweep_interval_ms.saturating_mul(NANOS_PER_MILLI);
    let mut clock_ns = 0u64;
    let mut last_sweep_ns = 0u64;

    let (state, reason) = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break (SessionState::Cancelled, CloseReason::Cancelled),
            event = frames.recv() => event,
        };
        let frame = match event {
            None => break (SessionState::Completed, CloseReason::CaptureEnd),
            Some(SourceEvent::Failed(e)) => {
                error!(error = %e, "Capture source failed, aborting session");
                counters.record_error(ErrorScope::Session, e.to_string());
                break (SessionState::Aborted, CloseReason::SourceError);
            }
            Some(SourceEvent::Frame(frame)) => frame,
        };

        counters.frame_read(frame.data.len());
        context.metrics.frames.inc();
        clock_ns = clock_ns.max(frame.timestamp_ns);

        match decode(&frame) {
            Ok(Decoded::Tcp(packet)) => {
                counters.frame_decoded();
                let routed = demux.route(packet, frame.index, frame.timestamp_ns, |key, class| {
                    FlowSlot::new(*key, class, Arc::clone(shared))
                });
                match routed {
                    Routed::Dispatch { slot, segment, .. } => {
                        if let Err(e) = pool.submit(&slot, Work::Segment(segment)).await {
                            counters.record_error(ErrorScope::Session, e.to_string());
                            break (SessionState::Aborted, CloseReason::SourceError);
                        }
                    }
                    Routed::Dropped => counters.segment_dropped(),
                }
            }
            Ok(Decoded::Skipped(reason)) => {
                counters.frame_skipped();
                trace!(frame = frame.index, reason = reason.as_str(), "Frame skipped");
            }
            Err(e) => {
                counters.frame_malformed();
                debug!(error = %e, "Malformed frame skipped");
            }
        }

        if clock_ns.saturating_sub(last_sweep_ns) >= sweep_every_ns {
            last_sweep_ns = clock_ns;
            for slot in demux.sweep_idle(clock_ns) {
                trace!(key = %slot.key(), "Idle flow closed");
                if let Err(e) = pool.submit(&slot, Work::Close(CloseReason::IdleTimeout)).await {
                    warn!(error = %e, "Idle close not dispatched");
                }
            }
        }
    };
    drop(frames);

    let remaining = demux.drain_all();
    info!(flows = remaining.len(), reason = ?reason, "Closing remaining flows");
    for slot in remaining {
        if let Err(e) = pool.submit(&slot, Work::Close(reason)).await {
            counters.record_error(ErrorScope::Session, e.to_string());
        }
    }
    state
}

async fn persist_summary(shared: &SessionShared) {
    let status = shared.counters.snapshot();
    if let Err(e) = shared.persister.put(Collection::Sessions, &status).await {
        warn!(error = %e, "Session summary not persisted");
    }
}
