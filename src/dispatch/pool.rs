//! Worker pool - priority groups of workers fed by the admission controller
//!
//! Workers are laid out in contiguous blocks, one block per group:
//! group `g` owns workers `[g * per_group, (g + 1) * per_group)`. Inside a
//! block the target worker is sampled with weight `1 / (1 + queue_size)`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::DispatcherConfig;
use crate::core::{Error, Result};
use crate::dispatch::balancer::{LoadBalancer, weighted_index};
use crate::dispatch::dedup::Dedup;
use crate::dispatch::registry::Registry;
use crate::dispatch::worker::{InFlight, Worker};
use crate::message::Message;

pub struct WorkerPool {
    workers: Vec<Worker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    balancer: Mutex<LoadBalancer>,
    dedup: Dedup,
    in_flight: Arc<InFlight>,
    per_group: usize,
    grace: Duration,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Spawns every worker; must be called inside a tokio runtime.
    pub fn new(config: &DispatcherConfig, registry: Arc<Registry>, balancer: LoadBalancer) -> Self {
        let groups = balancer.groups();
        let per_group = config.workers_per_group.max(1);
        let in_flight = Arc::new(InFlight::default());

        let (workers, handles): (Vec<_>, Vec<_>) = (0..groups * per_group)
            .map(|index| {
                Worker::spawn(
                    index,
                    config.queue_capacity.max(1),
                    registry.clone(),
                    in_flight.clone(),
                )
            })
            .unzip();

        info!(
            "Worker pool started: {} groups x {} workers",
            groups, per_group
        );

        Self {
            workers,
            handles: Mutex::new(handles),
            balancer: Mutex::new(balancer),
            dedup: Dedup::new(config.dedup_window(), config.dedup_capacity),
            in_flight,
            per_group,
            grace: config.shutdown_grace(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn groups(&self) -> usize {
        self.workers.len() / self.per_group
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Messages queued or in flight across all workers.
    pub fn pending(&self) -> usize {
        self.in_flight.get()
    }

    /// Observed share per priority group.
    pub fn group_shares(&self) -> Vec<f64> {
        self.balancer.lock().shares()
    }

    /// Routes a message to a worker. Duplicates of an already admitted id are
    /// dropped silently.
    pub async fn dispatch_to_worker(&self, message: Arc<Message>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.dedup.seen(&message) {
            debug!("Dropping duplicate {}", message);
            return Ok(());
        }

        let group = self
            .balancer
            .lock()
            .determine_priority_group(message.priority());
        let index = self.pick_worker(group);

        let id = message.id();
        if let Err(e) = self.enqueue(index, message).await {
            // not admitted, so a retry must not be taken for a duplicate
            self.dedup.forget(id);
            return Err(e);
        }
        self.balancer.lock().register_event(group)
    }

    fn pick_worker(&self, group: usize) -> usize {
        let start = group * self.per_group;
        let block = &self.workers[start..start + self.per_group];
        let depths: Vec<usize> = block.iter().map(Worker::queue_size).collect();
        start + choose_worker(&depths, rand::random::<f64>())
    }

    async fn enqueue(&self, index: usize, message: Arc<Message>) -> Result<()> {
        self.workers[index]
            .enqueue(message, &self.in_flight)
            .await
    }

    /// Resolves once every queued message has been handled, or at once after
    /// shutdown.
    pub async fn wait(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Stops every worker after it drains its queue. Workers still busy after
    /// the grace period are aborted.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let drain = async {
            for worker in &self.workers {
                worker.stop().await;
            }
            futures::future::join_all(handles).await
        };

        match tokio::time::timeout(self.grace, drain).await {
            Ok(_) => info!("Worker pool stopped"),
            Err(_) => {
                warn!(
                    "Workers still busy after {:?}, aborting {} pending",
                    self.grace,
                    self.pending()
                );
                aborts.iter().for_each(|a| a.abort());
            }
        }

        // no worker is left to drain what was queued behind Stop or aborted
        self.in_flight.close();
    }
}

/// `draw` is uniform in `[0, 1)`; idle workers are the most likely pick.
pub(crate) fn choose_worker(depths: &[usize], draw: f64) -> usize {
    let weights: Vec<f64> = depths.iter().map(|&d| 1.0 / (1.0 + d as f64)).collect();
    weighted_index(&weights, draw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BalancerConfig;
    use crate::core::{Symbol, Timeframe};
    use crate::dispatch::registry::handler_fn;
    use crate::message::{BacktestFinished, Event, MessageType, Payload, Reply};
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    fn event() -> Arc<Message> {
        Arc::new(Message::Event(Event::new(Payload::BacktestEnded(
            BacktestFinished {
                symbol: Symbol::new("ETHUSDT"),
                timeframe: Timeframe::H4,
                exit_price: Decimal::ONE,
            },
        ))))
    }

    fn pool(groups: usize, per_group: usize, registry: Arc<Registry>) -> WorkerPool {
        let config = DispatcherConfig {
            workers_per_group: per_group,
            priority_groups: groups,
            shutdown_grace_ms: 500,
            ..DispatcherConfig::default()
        };
        WorkerPool::new(
            &config,
            registry,
            LoadBalancer::new(groups, &BalancerConfig::default()),
        )
    }

    #[test]
    fn test_choose_worker_prefers_idle() {
        assert_eq!(choose_worker(&[0], 0.9), 0);
        // weights 1/51, 1/51, 1, 1/51: idle worker owns the middle of the range
        assert_eq!(choose_worker(&[50, 50, 0, 50], 0.5), 2);
    }

    #[tokio::test]
    async fn test_saturated_workers_are_avoided() {
        let registry = Arc::new(Registry::new(Duration::from_secs(5), 10));
        let gate = Arc::new(Semaphore::new(0));
        let blocker = gate.clone();
        registry.register(
            MessageType::BacktestEnded,
            Uuid::new_v4(),
            handler_fn(move |_| {
                let gate = blocker.clone();
                async move {
                    let _permit = gate.acquire().await?;
                    Ok::<_, anyhow::Error>(Reply::empty())
                }
            }),
            None,
        );

        let pool = pool(1, 4, registry);
        for index in [0, 1, 3] {
            for _ in 0..50 {
                pool.enqueue(index, event()).await.unwrap();
            }
        }

        let idle_picks = (0..1_000).filter(|_| pool.pick_worker(0) == 2).count();
        assert!(idle_picks >= 850, "idle worker picked {idle_picks}/1000");

        gate.add_permits(1_000);
        pool.wait().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_is_handled_once() {
        let registry = Arc::new(Registry::new(Duration::from_secs(1), 10));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            MessageType::BacktestEnded,
            Uuid::new_v4(),
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(Reply::empty())
                }
            }),
            None,
        );

        let pool = pool(3, 2, registry);
        let message = event();
        pool.dispatch_to_worker(message.clone()).await.unwrap();
        pool.dispatch_to_worker(message).await.unwrap();
        pool.wait().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_not_remembered() {
        let registry = Arc::new(Registry::new(Duration::from_secs(1), 10));
        let pool = pool(1, 1, registry);

        // the only worker exits, so its queue is closed while the pool is open
        pool.workers[0].stop().await;
        let handle = pool.handles.lock().pop().unwrap();
        handle.await.unwrap();

        let message = event();
        assert!(matches!(
            pool.dispatch_to_worker(message.clone()).await,
            Err(Error::Closed)
        ));
        assert!(pool.dedup.is_empty());
        assert!(!pool.dedup.seen(&message));
        assert_eq!(pool.pending(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let registry = Arc::new(Registry::new(Duration::from_secs(1), 10));
        let pool = pool(2, 1, registry);

        pool.shutdown().await;
        assert!(matches!(
            pool.dispatch_to_worker(event()).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace() {
        let registry = Arc::new(Registry::new(Duration::from_secs(30), 10));
        registry.register(
            MessageType::BacktestEnded,
            Uuid::new_v4(),
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, anyhow::Error>(Reply::empty())
            }),
            None,
        );

        let pool = pool(1, 1, registry);
        pool.dispatch_to_worker(event()).await.unwrap();

        let started = std::time::Instant::now();
        pool.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_returns_after_aborted_shutdown() {
        let registry = Arc::new(Registry::new(Duration::from_secs(30), 10));
        registry.register(
            MessageType::BacktestEnded,
            Uuid::new_v4(),
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, anyhow::Error>(Reply::empty())
            }),
            None,
        );

        let pool = pool(1, 1, registry);
        pool.dispatch_to_worker(event()).await.unwrap();
        pool.dispatch_to_worker(event()).await.unwrap();
        assert_eq!(pool.pending(), 2);

        pool.shutdown().await;

        tokio::time::timeout(Duration::from_secs(2), pool.wait())
            .await
            .expect("wait hung after shutdown");
        assert_eq!(pool.pending(), 0);
    }
}
