//! In-memory at-least-once task queue with delayed visibility.
//!
//! Ready envelopes live in a min-heap ordered by visibility time, FIFO within
//! the same instant. Consumed envelopes move to an in-flight table until they
//! are acked or nacked; an in-flight entry whose visibility deadline passes is
//! put back as a redelivery.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::core::{CoreError, Delivery, Receipt, TaskEnvelope, TaskQueueClient};
use crate::util::{duration_ms, Clock, SystemClock};

/// Wrapper ordering envelopes by visibility time (earliest first) and FIFO within it.
#[derive(Debug)]
struct ScheduledEnvelope {
    visible_at: u128,
    seq: u64,
    envelope: TaskEnvelope,
    redelivered: bool,
}

impl PartialEq for ScheduledEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledEnvelope {}

impl PartialOrd for ScheduledEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for the max-heap: earliest visibility, then lowest sequence, wins.
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct InFlight {
    envelope: TaskEnvelope,
    deadline: u128,
}

/// Counters exposed by [`InMemoryTaskQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Envelopes accepted by `enqueue`.
    pub enqueued: u64,
    /// Deliveries handed out, including redeliveries.
    pub delivered: u64,
    /// Deliveries acked.
    pub acked: u64,
    /// Deliveries nacked.
    pub nacked: u64,
    /// In-flight deliveries reclaimed after their visibility deadline.
    pub redelivered: u64,
    /// Envelopes waiting (visible or delayed).
    pub ready: usize,
    /// Envelopes delivered and not yet acknowledged.
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<ScheduledEnvelope>,
    in_flight: HashMap<u64, InFlight>,
    next_seq: u64,
    next_delivery: u64,
    stats: QueueStats,
}

impl QueueState {
    fn push(&mut self, envelope: TaskEnvelope, visible_at: u128, redelivered: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(ScheduledEnvelope {
            visible_at,
            seq,
            envelope,
            redelivered,
        });
    }

    fn reclaim_expired(&mut self, now: u128) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for delivery_id in expired {
            if let Some(flight) = self.in_flight.remove(&delivery_id) {
                warn!(
                    task_id = %flight.envelope.task_id,
                    delivery_id,
                    "visibility timeout expired; redelivering"
                );
                self.stats.redelivered += 1;
                self.push(flight.envelope, now, true);
            }
        }
    }

    fn next_event_at(&self) -> Option<u128> {
        let next_ready = self.ready.peek().map(|s| s.visible_at);
        let next_expiry = self.in_flight.values().map(|f| f.deadline).min();
        match (next_ready, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }
}

/// In-process queue implementing [`TaskQueueClient`].
///
/// Suitable for tests and single-process deployments; it does not survive a restart.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    max_depth: usize,
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskQueue {
    /// Default time a delivery stays invisible before it is redelivered.
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(420);

    /// Create a queue holding at most `max_depth` unacknowledged envelopes.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            visibility_timeout: Self::DEFAULT_VISIBILITY_TIMEOUT,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the visibility timeout for consumed envelopes.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Use an explicit clock for visibility times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Maximum number of unacknowledged envelopes.
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            ..state.stats
        }
    }

    /// Envelopes waiting in the queue, in delivery order, without consuming them.
    #[must_use]
    pub fn pending(&self) -> Vec<TaskEnvelope> {
        let state = self.state.lock();
        let mut scheduled: Vec<&ScheduledEnvelope> = state.ready.iter().collect();
        scheduled.sort_by(|a, b| b.cmp(a));
        scheduled.into_iter().map(|s| s.envelope.clone()).collect()
    }

    /// Pop the first visible envelope, moving it in flight.
    fn try_take(&self, now: u128) -> Result<Option<Delivery>, Option<u128>> {
        let mut state = self.state.lock();
        state.reclaim_expired(now);
        let visible = state.ready.peek().is_some_and(|s| s.visible_at <= now);
        if !visible {
            return Err(state.next_event_at());
        }
        let Some(next) = state.ready.pop() else {
            return Err(None);
        };

        let delivery_id = state.next_delivery;
        state.next_delivery += 1;
        state.stats.delivered += 1;
        let receipt = Receipt {
            delivery_id,
            task_id: next.envelope.task_id,
        };
        state.in_flight.insert(
            delivery_id,
            InFlight {
                envelope: next.envelope.clone(),
                deadline: now + duration_ms(self.visibility_timeout),
            },
        );
        Ok(Some(Delivery {
            envelope: next.envelope,
            receipt,
            redelivered: next.redelivered,
        }))
    }
}

#[async_trait]
impl TaskQueueClient for InMemoryTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), CoreError> {
        {
            let mut state = self.state.lock();
            if state.depth() >= self.max_depth {
                return Err(CoreError::QueueFull("max queue depth reached".into()));
            }
            let visible_at = self.clock.now_ms() + duration_ms(delay);
            state.push(envelope, visible_at, false);
            state.stats.enqueued += 1;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, CoreError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_event = match self.try_take(self.clock.now_ms()) {
                Ok(delivery) => return Ok(delivery),
                Err(next_event) => next_event,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut nap = deadline - now;
            if let Some(at) = next_event {
                let until = at.saturating_sub(self.clock.now_ms()).max(1);
                nap = nap.min(Duration::from_millis(u64::try_from(until).unwrap_or(u64::MAX)));
            }

            tokio::select! {
                () = &mut notified => {}
                () = sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if state.in_flight.remove(&receipt.delivery_id).is_none() {
            return Err(CoreError::UnknownReceipt(receipt.task_id.to_string()));
        }
        state.stats.acked += 1;
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, delay: Duration) -> Result<(), CoreError> {
        {
            let mut state = self.state.lock();
            let Some(flight) = state.in_flight.remove(&receipt.delivery_id) else {
                return Err(CoreError::UnknownReceipt(receipt.task_id.to_string()));
            };
            let visible_at = self.clock.now_ms() + duration_ms(delay);
            state.push(flight.envelope, visible_at, false);
            state.stats.nacked += 1;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self) -> Result<usize, CoreError> {
        Ok(self.state.lock().depth())
    }
}
