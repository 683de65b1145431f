//! Worker - one bounded FIFO queue drained by one task

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::core::{Error, Result};
use crate::dispatch::registry::Registry;
use crate::message::Message;

pub(crate) enum WorkItem {
    Message(Arc<Message>),
    Stop,
}

/// Pool-wide count of messages queued or being handled. Once closed the
/// count is zero and `wait_idle` never blocks.
#[derive(Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    /// Forgets messages stranded in aborted or stopped workers.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.count.store(0, Ordering::Release);
        self.idle.notify_waiters();
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) || self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct Worker {
    index: usize,
    tx: flume::Sender<WorkItem>,
    depth: Arc<AtomicUsize>,
}

impl Worker {
    pub(crate) fn spawn(
        index: usize,
        capacity: usize,
        registry: Arc<Registry>,
        in_flight: Arc<InFlight>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = flume::bounded(capacity);
        let depth = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(run(index, rx, registry, depth.clone(), in_flight));
        (Self { index, tx, depth }, handle)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Messages waiting in this worker's queue, plus the one being handled.
    pub fn queue_size(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Waits for room when the queue is full.
    pub(crate) async fn enqueue(&self, message: Arc<Message>, in_flight: &InFlight) -> Result<()> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        in_flight.begin();

        if self.tx.send_async(WorkItem::Message(message)).await.is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            in_flight.end();
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Queued after any pending messages, so those drain first.
    pub(crate) async fn stop(&self) {
        let _ = self.tx.send_async(WorkItem::Stop).await;
    }
}

async fn run(
    index: usize,
    rx: flume::Receiver<WorkItem>,
    registry: Arc<Registry>,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<InFlight>,
) {
    debug!("Worker {} started", index);

    while let Ok(item) = rx.recv_async().await {
        let message = match item {
            WorkItem::Message(message) => message,
            WorkItem::Stop => break,
        };

        // Handler panics are already contained by the registry; this guards
        // the loop itself so one bad message never kills the worker.
        if AssertUnwindSafe(registry.handle(message.clone()))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Worker {} failed while processing {}", index, message);
        }

        depth.fetch_sub(1, Ordering::AcqRel);
        in_flight.end();
    }

    debug!("Worker {} stopped", index);
}
