//! Running service: scheduler ticker plus worker pool, with health reporting.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::builders::DispatchCore;
use crate::core::{CircuitState, CoreError, DispatchStats, PoolStats, ServiceCircuitState, WorkerPool};
use crate::util::init_tracing;

/// Health payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Queue reachable and no circuit open.
    pub ok: bool,
    /// Breaker state per service seen so far.
    pub circuits: Vec<ServiceCircuitState>,
    /// Unacknowledged envelopes, `None` if the queue did not answer.
    pub queue_depth: Option<usize>,
    /// Dispatcher counters.
    pub dispatch: DispatchStats,
    /// Worker pool counters.
    pub pool: PoolStats,
}

/// Scheduler and worker pool running on the current tokio runtime.
#[derive(Debug)]
pub struct DispatchService {
    core: DispatchCore,
    pool: WorkerPool,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl DispatchService {
    /// Start the scheduler ticker and the worker pool.
    ///
    /// Installs the default tracing subscriber if the host has not set one.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] if the worker pool configuration is invalid.
    pub fn start(core: DispatchCore) -> Result<Self, CoreError> {
        init_tracing();
        let pool = WorkerPool::start(
            core.config.worker_pool_config(),
            Arc::clone(&core.queue),
            Arc::clone(&core.dispatcher),
        )?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&core.scheduler);
        let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        info!("dispatch service started");
        Ok(Self {
            core,
            pool,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            shutdown_tx,
        })
    }

    /// Components the service runs.
    #[must_use]
    pub const fn core(&self) -> &DispatchCore {
        &self.core
    }

    /// Breaker snapshots, queue depth and counters.
    pub async fn health(&self) -> HealthReport {
        let circuits = self.core.registry.snapshots();
        let queue_depth = match self.core.queue.depth().await {
            Ok(depth) => Some(depth),
            Err(err) => {
                warn!(error = %err, "queue depth unavailable");
                None
            }
        };
        let ok = queue_depth.is_some() && circuits.iter().all(|c| c.state != CircuitState::Open);
        HealthReport {
            ok,
            circuits,
            queue_depth,
            dispatch: self.core.dispatcher.stats(),
            pool: self.pool.stats(),
        }
    }

    /// Stop the scheduler, then let workers finish their current delivery.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.scheduler_task.lock().take();
        if let Some(task) = task {
            let grace = self.core.config.worker_pool_config().shutdown_timeout.max(Duration::from_secs(1));
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "scheduler task panicked"),
                Err(_) => warn!("scheduler did not stop within timeout; detaching"),
            }
        }
        self.pool.shutdown().await;
        info!("dispatch service stopped");
    }
}
