//! Notification dispatcher: processes one delivered envelope end to end.
//!
//! Per delivery:
//!
//! 1. validate the payload and resolve the channel provider;
//! 2. claim the idempotency key for the envelope's task id (a lost claim means
//!    another task owns or finished this occurrence, so the delivery is acked
//!    without sending; a redelivery of the same task reclaims its own key);
//! 3. send through the provider's circuit breaker under the soft/hard time limits
//!    (a half-open circuit busy with its trial defers the delivery instead);
//! 4. on success commit the key and ack; on failure release the claim and let
//!    the retry policy choose between a delayed re-enqueue and the dead-letter store.
//!
//! The queue delivery is acked only after its outcome is durable (ledger
//! commit, re-enqueue, or dead letter). Storage hiccups turn into a nack with
//! a short delay instead.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::core::{
    build_audit_event, AuditAction, AuditSink, ChannelError, ChannelProvider, ChannelRouter,
    CircuitBreakerRegistry, CoreError, DeadLetter, DeadLetterStore, Delivery, FailureKind,
    GuardError, IdempotencyLedger, NotificationPayload, Receipt, RetryDecision, RetryPolicy,
    SendSummary, TaskEnvelope, TaskQueueClient,
};
use crate::util::{Clock, SystemClock};

/// Time limits applied to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLimits {
    /// Past this a running send is logged as slow.
    pub soft_limit: Duration,
    /// Past this a running send is abandoned and counted as a transient failure.
    pub hard_limit: Duration,
    /// Nack delay used when the ledger or queue is unavailable.
    pub ledger_retry_delay: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            soft_limit: Duration::from_secs(300),
            hard_limit: Duration::from_secs(360),
            ledger_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Final outcome of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Provider accepted the notification.
    Sent(SendSummary),
    /// Key committed or claimed by another task; nothing was sent.
    Duplicate,
    /// Failure with a new attempt enqueued.
    RetryScheduled {
        /// Attempt number of the new envelope.
        attempt: u32,
        /// Delay before it becomes visible.
        delay: Duration,
    },
    /// Task parked in the dead-letter store.
    DeadLettered(FailureKind),
    /// Circuit half-open with its trial in flight; the delivery was nacked
    /// without using an attempt.
    Deferred {
        /// Delay before the delivery becomes visible again.
        delay: Duration,
    },
    /// Infrastructure failure; the delivery was nacked for redelivery.
    Requeued,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    processed: AtomicU64,
    sent: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    requeued: AtomicU64,
    redelivered: AtomicU64,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Deliveries processed.
    pub processed: u64,
    /// Notifications sent.
    pub sent: u64,
    /// Deliveries skipped as duplicates.
    pub duplicates: u64,
    /// Retries enqueued.
    pub retried: u64,
    /// Tasks dead-lettered.
    pub dead_lettered: u64,
    /// Deliveries deferred behind a half-open trial.
    pub deferred: u64,
    /// Deliveries nacked after infrastructure errors.
    pub requeued: u64,
    /// Deliveries flagged as redelivered by the queue.
    pub redelivered: u64,
}

/// Worker-side processor for queued notification tasks.
pub struct NotificationDispatcher {
    queue: Arc<dyn TaskQueueClient>,
    ledger: Arc<dyn IdempotencyLedger>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    channels: ChannelRouter,
    dead_letters: Arc<dyn DeadLetterStore>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Arc<dyn Clock>,
    limits: DispatchLimits,
    counters: DispatchCounters,
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("retry", &self.retry)
            .field("channels", &self.channels)
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    /// Dispatcher with default limits, the system clock, and no audit sink.
    #[must_use]
    pub fn new(
        queue: Arc<dyn TaskQueueClient>,
        ledger: Arc<dyn IdempotencyLedger>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        channels: ChannelRouter,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            queue,
            ledger,
            breakers,
            retry,
            channels,
            dead_letters,
            audit: None,
            clock: Arc::new(SystemClock),
            limits: DispatchLimits::default(),
            counters: DispatchCounters::default(),
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Use an explicit clock for attempt history timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the time limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: DispatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Circuit breakers guarding the providers.
    #[must_use]
    pub const fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            processed: c.processed.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
        }
    }

    /// Process one delivery to a final, acknowledged outcome.
    pub async fn process(&self, delivery: Delivery) -> DispatchOutcome {
        let Delivery {
            envelope,
            receipt,
            redelivered,
        } = delivery;
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        if redelivered {
            self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %envelope.task_id,
                idempotency_key = %envelope.idempotency_key,
                "processing redelivered task"
            );
        }

        let provider = match envelope
            .payload
            .validate()
            .and_then(|()| self.channels.resolve(&envelope.payload.channel))
        {
            Ok(provider) => provider,
            Err(err) => {
                return self
                    .handle_failure(envelope, &receipt, err.kind(), err.to_string(), false)
                    .await;
            }
        };

        let key = envelope.idempotency_key.clone();
        let owner = envelope.task_id.to_string();
        let claimed = match timeout(self.limits.hard_limit, self.ledger.claim(&key, &owner)).await {
            Ok(Ok(claimed)) => claimed,
            Ok(Err(err)) => {
                warn!(task_id = %envelope.task_id, idempotency_key = %key, error = %err, "ledger claim failed");
                return self.requeue(&receipt, self.limits.ledger_retry_delay).await;
            }
            Err(_) => {
                let err = CoreError::Timeout(self.limits.hard_limit);
                warn!(task_id = %envelope.task_id, idempotency_key = %key, error = %err, "ledger claim timed out");
                return self.requeue(&receipt, self.limits.ledger_retry_delay).await;
            }
        };

        if !claimed {
            info!(
                task_id = %envelope.task_id,
                idempotency_key = %key,
                "idempotency key committed or claimed by another task; skipping send"
            );
            self.audit(&envelope, AuditAction::Duplicate, None);
            self.ack(&receipt).await;
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Duplicate;
        }

        let service = provider.service_name();
        let result = self
            .breakers
            .guard_with(
                &service,
                || self.send_with_limits(provider.as_ref(), &envelope),
                |err: &ChannelError| err.is_transient(),
            )
            .await;

        match result {
            Ok(summary) => self.complete(&envelope, &receipt, summary).await,
            Err(GuardError::CircuitOpen {
                retry_after,
                trial_in_flight: true,
                ..
            }) => self.defer(&envelope, &receipt, &service, retry_after).await,
            Err(GuardError::CircuitOpen { retry_after, .. }) => {
                let message = format!("circuit open for {service}");
                self.handle_failure(
                    envelope,
                    &receipt,
                    FailureKind::CircuitOpen { retry_after },
                    message,
                    true,
                )
                .await
            }
            Err(GuardError::Inner(err)) => {
                self.handle_failure(envelope, &receipt, err.kind(), err.to_string(), true)
                    .await
            }
        }
    }

    async fn send_with_limits(
        &self,
        provider: &dyn ChannelProvider,
        envelope: &TaskEnvelope,
    ) -> Result<SendSummary, ChannelError> {
        let NotificationPayload {
            recipient, message, ..
        } = &envelope.payload;
        let mut send = provider.send(recipient, message);

        tokio::select! {
            result = &mut send => return result,
            () = sleep(self.limits.soft_limit) => {
                warn!(
                    task_id = %envelope.task_id,
                    channel = %envelope.payload.channel,
                    soft_limit_secs = self.limits.soft_limit.as_secs(),
                    "send exceeded soft time limit"
                );
            }
        }

        let remaining = self.limits.hard_limit.saturating_sub(self.limits.soft_limit);
        timeout(remaining, send).await.unwrap_or_else(|_| {
            Err(ChannelError::Transient(format!(
                "send aborted at hard time limit of {:?}",
                self.limits.hard_limit
            )))
        })
    }

    async fn complete(&self, envelope: &TaskEnvelope, receipt: &Receipt, summary: SendSummary) -> DispatchOutcome {
        if let Err(err) = self.ledger.commit(&envelope.idempotency_key, &summary).await {
            // The claim stays in place; other deliveries of this key are skipped
            // until its lease expires.
            error!(
                task_id = %envelope.task_id,
                idempotency_key = %envelope.idempotency_key,
                error = %err,
                "notification sent but ledger commit failed"
            );
        }
        info!(
            task_id = %envelope.task_id,
            work_item_id = %envelope.payload.work_item_id,
            channel = %envelope.payload.channel,
            attempt = envelope.attempt_count,
            status = %summary.status,
            "notification sent"
        );
        self.audit(envelope, AuditAction::Sent, Some(summary.status.clone()));
        self.ack(receipt).await;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::Sent(summary)
    }

    async fn handle_failure(
        &self,
        mut envelope: TaskEnvelope,
        receipt: &Receipt,
        failure: FailureKind,
        error: String,
        claimed: bool,
    ) -> DispatchOutcome {
        if claimed {
            self.release(&envelope).await;
        }

        let now = self.clock.now_ms();
        envelope.record_failure(failure.clone(), error.clone(), now);

        match self.retry.decide_for(&envelope, &failure) {
            RetryDecision::Retry { delay } => {
                let next = envelope.next_attempt(now, delay);
                let attempt = next.attempt_count;
                if let Err(err) = self.queue.enqueue(next, delay).await {
                    error!(task_id = %envelope.task_id, error = %err, "failed to enqueue retry");
                    return self.requeue(receipt, delay).await;
                }
                warn!(
                    task_id = %envelope.task_id,
                    work_item_id = %envelope.payload.work_item_id,
                    failure = %failure,
                    error = %error,
                    next_attempt = attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "dispatch failed; retry scheduled"
                );
                self.audit(&envelope, AuditAction::RetryScheduled, Some(failure.to_string()));
                self.ack(receipt).await;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::RetryScheduled { attempt, delay }
            }
            RetryDecision::DeadLetter | RetryDecision::NoRetry => {
                self.dead_letter(envelope, receipt, failure, error).await
            }
        }
    }

    async fn dead_letter(
        &self,
        envelope: TaskEnvelope,
        receipt: &Receipt,
        failure: FailureKind,
        last_error: String,
    ) -> DispatchOutcome {
        let history: Vec<String> = envelope
            .history
            .iter()
            .map(|r| format!("#{} {}: {}", r.attempt, r.failure, r.error))
            .collect();
        error!(
            task_id = %envelope.task_id,
            work_item_id = %envelope.payload.work_item_id,
            idempotency_key = %envelope.idempotency_key,
            channel = %envelope.payload.channel,
            attempts = envelope.history.len(),
            failure = %failure,
            last_error = %last_error,
            history = ?history,
            "task dead-lettered"
        );

        let letter = DeadLetter {
            envelope: envelope.clone(),
            failure: failure.clone(),
            last_error,
            dead_lettered_at: self.clock.now_ms(),
        };
        if let Err(err) = self.dead_letters.deliver(letter) {
            error!(task_id = %envelope.task_id, error = %err, "dead-letter store unavailable");
            return self.requeue(receipt, self.limits.ledger_retry_delay).await;
        }

        self.audit(&envelope, AuditAction::DeadLettered, Some(failure.to_string()));
        self.ack(receipt).await;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::DeadLettered(failure)
    }

    /// Return the delivery unchanged while another task runs the half-open trial.
    ///
    /// The trial is bounded by the hard limit, so the wait is too.
    async fn defer(
        &self,
        envelope: &TaskEnvelope,
        receipt: &Receipt,
        service: &str,
        delay: Duration,
    ) -> DispatchOutcome {
        self.release(envelope).await;
        info!(
            task_id = %envelope.task_id,
            service = %service,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "half-open trial in flight; delivery deferred"
        );
        if let Err(err) = self.queue.nack(receipt, delay).await {
            warn!(task_id = %receipt.task_id, error = %err, "nack failed; delivery will reappear after its visibility timeout");
        }
        self.counters.deferred.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::Deferred { delay }
    }

    async fn release(&self, envelope: &TaskEnvelope) {
        let owner = envelope.task_id.to_string();
        match self.ledger.release(&envelope.idempotency_key, &owner).await {
            Ok(()) => self.audit(envelope, AuditAction::Released, None),
            Err(err) => warn!(
                task_id = %envelope.task_id,
                idempotency_key = %envelope.idempotency_key,
                error = %err,
                "ledger release failed; claim will be taken over after its lease"
            ),
        }
    }

    async fn requeue(&self, receipt: &Receipt, delay: Duration) -> DispatchOutcome {
        if let Err(err) = self.queue.nack(receipt, delay).await {
            warn!(task_id = %receipt.task_id, error = %err, "nack failed; delivery will reappear after its visibility timeout");
        }
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::Requeued
    }

    async fn ack(&self, receipt: &Receipt) {
        match self.queue.ack(receipt).await {
            Ok(()) => debug!(task_id = %receipt.task_id, "delivery acked"),
            Err(err) => warn!(task_id = %receipt.task_id, error = %err, "ack failed"),
        }
    }

    fn audit(&self, envelope: &TaskEnvelope, action: AuditAction, detail: Option<String>) {
        if let Some(sink) = &self.audit {
            sink.record(build_audit_event(envelope, action, detail));
        }
    }
}
