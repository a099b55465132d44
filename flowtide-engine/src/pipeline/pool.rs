//! Worker pool draining ready flow slots.
//!
//! Slots are handed out through one shared queue; the `scheduled` flag on
//! each slot keeps it in the queue at most once. A semaphore bounds the work
//! dispatched but not yet handled, which is what pushes back on the driver
//! (and through the frame channel, on the capture reader) when storage is
//! slow.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info_span, trace, Instrument};

use crate::error::EngineError;
use crate::pipeline::actor::{FlowSlot, Work, WorkItem};

pub(crate) struct WorkerPool {
    ready: mpsc::UnboundedSender<Arc<FlowSlot>>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, max_in_flight: usize) -> Self {
        let (ready, queue) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(queue));
        let max_in_flight = max_in_flight.max(1);
        let workers = (0..workers.max(1))
            .map(|id| {
                let queue = Arc::clone(&queue);
                tokio::spawn(worker_loop(queue).instrument(info_span!("flow_worker", id)))
            })
            .collect();
        Self {
            ready,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            workers,
        }
    }

    /// Queues `work` on the slot, waiting for an in-flight permit first.
    pub async fn submit(&self, slot: &Arc<FlowSlot>, work: Work) -> Result<(), EngineError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::PoolStopped)?;
        if slot.enqueue(WorkItem { work, permit }) {
            trace!(key = %slot.key(), "Slot scheduled");
            self.ready
                .send(Arc::clone(slot))
                .map_err(|_| EngineError::PoolStopped)?;
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Lets the workers finish every queued slot, then joins them.
    pub async fn shutdown(self) -> Vec<JoinError> {
        debug!(in_flight = self.in_flight(), "Worker pool draining");
        drop(self.ready);
        let mut failures = Vec::new();
        for worker in self.workers {
            if let Err(e) = worker.await {
                failures.push(e);
            }
        }
        failures
    }
}

async fn worker_loop(queue: Arc<Mutex<mpsc::UnboundedReceiver<Arc<FlowSlot>>>>) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(slot) = next else {
            break;
        };
        slot.drain().await;
    }
    trace!("Worker stopped");
}
