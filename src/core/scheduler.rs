//! Periodic sweep that turns due work items into queued tasks.
//!
//! The sweep itself does not need to be exclusive: overlapping sweeps (two
//! scheduler replicas, or a sweep slower than its interval) may enqueue the
//! same occurrence twice. Both envelopes carry the same idempotency key, so
//! the ledger lets only one of them send.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::{
    build_audit_event, AuditAction, AuditSink, CoreError, IdempotencyLedger, TaskEnvelope,
    TaskQueueClient, WorkSource,
};
use crate::util::{duration_ms, Clock, SystemClock};

/// Scheduler timing and the attempt budget stamped on new envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between due-item sweeps.
    pub sweep_interval: Duration,
    /// Time between ledger retention passes.
    pub retention_interval: Duration,
    /// Age after which completion records are pruned.
    pub ledger_retention: Duration,
    /// Budget carried by every first-attempt envelope.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(24 * 60 * 60),
            ledger_retention: Duration::from_secs(90 * 24 * 60 * 60),
            max_attempts: 4,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Items the work source reported as due.
    pub due: usize,
    /// Envelopes put on the queue.
    pub enqueued: usize,
    /// Items whose enqueue failed; they stay due for the next sweep.
    pub failed: usize,
}

/// Enqueues due reminders and prunes the ledger on a schedule.
pub struct ReminderScheduler {
    source: Arc<dyn WorkSource>,
    queue: Arc<dyn TaskQueueClient>,
    ledger: Arc<dyn IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl fmt::Debug for ReminderScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReminderScheduler {
    /// Scheduler on the system clock.
    #[must_use]
    pub fn new(
        source: Arc<dyn WorkSource>,
        queue: Arc<dyn TaskQueueClient>,
        ledger: Arc<dyn IdempotencyLedger>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            source,
            queue,
            ledger,
            clock: Arc::new(SystemClock),
            config,
            audit: None,
        }
    }

    /// Use an explicit clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Scheduler configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Enqueue one first-attempt envelope per due item.
    ///
    /// An item is marked dispatched only after its envelope is on the queue;
    /// a failed mark is logged and the item is simply enqueued again next
    /// sweep, where the ledger deduplicates it.
    ///
    /// # Errors
    ///
    /// Fails only when the work source cannot list due items.
    pub async fn sweep_once(&self) -> Result<SweepReport, CoreError> {
        let now = self.clock.now_ms();
        let due = self.source.list_due(now).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for item in &due {
            let envelope = TaskEnvelope::for_work_item(item, self.config.max_attempts, now);
            let task_id = envelope.task_id;
            let audit_event = self
                .audit
                .as_ref()
                .map(|_| build_audit_event(&envelope, AuditAction::Enqueued, None));

            if let Err(err) = self.queue.enqueue(envelope, Duration::ZERO).await {
                report.failed += 1;
                error!(work_item_id = %item.id, error = %err, "failed to enqueue due item");
                continue;
            }
            report.enqueued += 1;
            debug!(work_item_id = %item.id, task_id = %task_id, "due item enqueued");
            if let (Some(sink), Some(event)) = (&self.audit, audit_event) {
                sink.record(event);
            }

            if let Err(err) = self.source.mark_dispatched(&item.id).await {
                warn!(work_item_id = %item.id, error = %err, "failed to mark item dispatched");
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                enqueued = report.enqueued,
                failed = report.failed,
                "sweep complete"
            );
        }
        Ok(report)
    }

    /// Delete ledger completion records older than the retention window.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub async fn prune_ledger(&self) -> Result<usize, CoreError> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(duration_ms(self.config.ledger_retention));
        let removed = self.ledger.prune_completed_before(cutoff).await?;
        info!(removed, cutoff_ms = %cutoff, "ledger retention pass complete");
        Ok(removed)
    }

    /// Run sweeps and retention passes until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retention = interval_at(
            Instant::now() + self.config.retention_interval,
            self.config.retention_interval,
        );
        retention.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "reminder scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "sweep failed");
                    }
                }
                _ = retention.tick() => {
                    if let Err(err) = self.prune_ledger().await {
                        error!(error = %err, "ledger retention pass failed");
                    }
                }
            }
        }
        info!("reminder scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkItem;
    use crate::infra::{InMemoryLedger, InMemoryTaskQueue, InMemoryWorkSource};
    use crate::util::ManualClock;

    fn item(id: &str, due_at: u128) -> WorkItem {
        WorkItem {
            id: id.into(),
            due_at,
            channel: "email".into(),
            recipient: "a@example.com".into(),
            message: "ping".into(),
        }
    }

    #[tokio::test]
    async fn test_sweep_enqueues_only_due_items() {
        let clock = Arc::new(ManualClock::new(10_000));
        let source = Arc::new(InMemoryWorkSource::new());
        source.add(item("due", 9_000));
        source.add(item("later", 20_000));
        let queue = Arc::new(InMemoryTaskQueue::new(100));
        let ledger = Arc::new(InMemoryLedger::new());
        let scheduler = ReminderScheduler::new(source.clone(), queue.clone(), ledger, SchedulerConfig::default())
            .with_clock(clock);

        let report = scheduler.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { due: 1, enqueued: 1, failed: 0 });
        assert!(source.is_dispatched("due"));
        assert!(!source.is_dispatched("later"));

        let delivery = queue.consume(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.envelope.payload.work_item_id, "due");
        assert_eq!(delivery.envelope.max_attempts, 4);
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_item_due() {
        let clock = Arc::new(ManualClock::new(10_000));
        let source = Arc::new(InMemoryWorkSource::new());
        source.add(item("a", 1_000));
        source.add(item("b", 2_000));
        let queue = Arc::new(InMemoryTaskQueue::new(1));
        let ledger = Arc::new(InMemoryLedger::new());
        let scheduler = ReminderScheduler::new(source.clone(), queue, ledger, SchedulerConfig::default())
            .with_clock(clock);

        let report = scheduler.sweep_once().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(source.dispatched_count(), 1);
    }

    #[tokio::test]
    async fn test_prune_uses_retention_window() {
        let day = Duration::from_secs(24 * 60 * 60);
        let clock = Arc::new(ManualClock::new(0));
        let source = Arc::new(InMemoryWorkSource::new());
        let queue = Arc::new(InMemoryTaskQueue::new(10));
        let ledger = Arc::new(InMemoryLedger::with_clock(clock.clone()));
        let summary = crate::core::SendSummary::new("sent");

        assert!(ledger.claim("old", "t1").await.unwrap());
        ledger.commit("old", &summary).await.unwrap();
        clock.advance(day * 50);
        assert!(ledger.claim("new", "t2").await.unwrap());
        ledger.commit("new", &summary).await.unwrap();
        clock.advance(day * 45);

        let scheduler = ReminderScheduler::new(source, queue, ledger.clone(), SchedulerConfig::default())
            .with_clock(clock);
        assert_eq!(scheduler.prune_ledger().await.unwrap(), 1);
        assert!(ledger.record("old").await.unwrap().is_none());
        assert!(ledger.record("new").await.unwrap().is_some());
    }
}
