//! Worker pool consuming the task queue and feeding the dispatcher.
//!
//! Each worker is a tokio task that loops `consume -> process` until shutdown
//! is signalled. A delivery already being processed is finished before the
//! worker exits; an idle worker exits immediately.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_dispatch::core::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::start(WorkerPoolConfig::default(), queue, dispatcher)?;
//! // ...
//! pool.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{CoreError, NotificationDispatcher, TaskQueueClient};

/// Worker pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Longest a worker blocks in `consume` before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Time each worker gets to finish its current delivery on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the worker count; `0` means one worker per CPU.
    #[must_use]
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = if worker_count == 0 {
            num_cpus::get()
        } else {
            worker_count
        };
        self
    }

    /// Set the consume poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be greater than 0".into());
        }
        Ok(())
    }
}

/// Statistics about pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of workers started.
    pub worker_count: usize,
    /// Deliveries currently being processed.
    pub active_tasks: u64,
    /// Deliveries processed to an outcome.
    pub completed_tasks: u64,
    /// Failed `consume` calls.
    pub consume_errors: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    active_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    consume_errors: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            consume_errors: self.consume_errors.load(Ordering::Relaxed),
        }
    }
}

/// Pool of queue-consuming workers.
#[derive(Debug)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Spawn the workers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] if the configuration does not validate.
    pub fn start(
        config: WorkerPoolConfig,
        queue: Arc<dyn TaskQueueClient>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Result<Self, CoreError> {
        config.validate().map_err(CoreError::InvalidConfig)?;

        let (shutdown_tx, _) = watch::channel(false);
        let counters = Arc::new(PoolCounters::default());
        let workers = (0..config.worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&dispatcher),
                    shutdown_tx.subscribe(),
                    Arc::clone(&counters),
                    config.poll_interval,
                ))
            })
            .collect();

        info!(worker_count = config.worker_count, "worker pool started");
        Ok(Self {
            config,
            workers: Mutex::new(workers),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            counters,
        })
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop consuming and wait for workers to finish their current delivery.
    ///
    /// Workers that do not exit within the shutdown timeout are detached.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker pool");
        let _ = self.shutdown_tx.send(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        for (idx, worker) in workers.into_iter().enumerate() {
            match tokio::time::timeout(self.config.shutdown_timeout, worker).await {
                Ok(Ok(())) => debug!(worker_id = idx, "worker joined"),
                Ok(Err(err)) => warn!(worker_id = idx, error = %err, "worker panicked"),
                Err(_) => warn!(worker_id = idx, "worker did not exit within timeout; detaching"),
            }
        }
        info!(worker_count = self.config.worker_count, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(true);
            debug!("worker pool dropped without explicit shutdown; workers will be detached");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn TaskQueueClient>,
    dispatcher: Arc<NotificationDispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
    counters: Arc<PoolCounters>,
    poll_interval: Duration,
) {
    debug!(worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            consumed = queue.consume(poll_interval) => match consumed {
                Ok(Some(delivery)) => {
                    counters.active_tasks.fetch_add(1, Ordering::Relaxed);
                    let task_id = delivery.envelope.task_id;
                    let outcome = dispatcher.process(delivery).await;
                    counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
                    counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id, task_id = %task_id, outcome = ?outcome, "delivery processed");
                }
                Ok(None) => {}
                Err(err) => {
                    counters.consume_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(worker_id, error = %err, "consume failed");
                    tokio::time::sleep(poll_interval).await;
                }
            },
        }
    }
    debug!(worker_id, "worker exiting");
}
