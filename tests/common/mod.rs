//! Shared helpers for integration tests: scripted channel providers and a wired dispatcher.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus_dispatch::core::{
    BreakerConfig, ChannelError, ChannelProvider, ChannelRouter, CircuitBreakerRegistry,
    InMemoryAuditSink, NotificationDispatcher, RetryPolicy, SendSummary, TaskEnvelope, WorkItem,
};
use prometheus_dispatch::infra::{InMemoryDeadLetterStore, InMemoryLedger, InMemoryTaskQueue};
use prometheus_dispatch::util::{Clock, ManualClock};

// ============================================================================
// MOCK CHANNEL
// ============================================================================

/// Channel provider returning scripted results, then a fallback.
pub struct MockChannel {
    channel: String,
    script: Mutex<VecDeque<Result<SendSummary, ChannelError>>>,
    fallback: Result<SendSummary, ChannelError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockChannel {
    /// Provider that always succeeds.
    pub fn ok(channel: &str) -> Self {
        Self::with_fallback(channel, Ok(SendSummary::new("sent").with_provider_ref("mock-1")))
    }

    /// Provider that always fails transiently.
    pub fn failing(channel: &str) -> Self {
        Self::with_fallback(channel, Err(ChannelError::Transient("provider unavailable".into())))
    }

    /// Provider with an explicit fallback result.
    pub fn with_fallback(channel: &str, fallback: Result<SendSummary, ChannelError>) -> Self {
        Self {
            channel: channel.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Results returned, in order, before the fallback.
    pub fn scripted(self, results: Vec<Result<SendSummary, ChannelError>>) -> Self {
        *self.script.lock() = results.into();
        self
    }

    /// Sleep this long inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `send` invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelProvider for MockChannel {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, _recipient: &str, _message: &str) -> Result<SendSummary, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Dispatcher wired to in-memory backends and a manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub ledger: Arc<InMemoryLedger>,
    pub registry: Arc<CircuitBreakerRegistry>,
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub dispatcher: NotificationDispatcher,
}

impl Harness {
    /// Harness with one provider and an un-jittered 4-attempt policy.
    pub fn new(provider: Arc<MockChannel>) -> Self {
        Self::with(provider, BreakerConfig::default(), RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(300)))
    }

    /// Harness with explicit breaker and retry settings.
    pub fn with(provider: Arc<MockChannel>, breaker: BreakerConfig, retry: RetryPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let queue = Arc::new(InMemoryTaskQueue::new(1_000).with_clock(Arc::clone(&dyn_clock)));
        let ledger = Arc::new(InMemoryLedger::with_clock(Arc::clone(&dyn_clock)));
        let registry = Arc::new(CircuitBreakerRegistry::with_clock(breaker, Arc::clone(&dyn_clock)));
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let audit = Arc::new(InMemoryAuditSink::new(1_000));

        let channels = ChannelRouter::new().with_provider(provider);
        let dispatcher = NotificationDispatcher::new(
            queue.clone(),
            ledger.clone(),
            Arc::clone(&registry),
            retry,
            channels,
            dead_letters.clone(),
        )
        .with_audit(audit.clone())
        .with_clock(dyn_clock);

        Self {
            clock,
            queue,
            ledger,
            registry,
            dead_letters,
            audit,
            dispatcher,
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Work item due at `due_at` on `channel`.
pub fn work_item(id: &str, channel: &str, due_at: u128) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        due_at,
        channel: channel.to_string(),
        recipient: "someone@example.com".to_string(),
        message: format!("Reminder for task {id}"),
    }
}

/// First-attempt envelope for a work item.
pub fn envelope(id: &str, channel: &str) -> TaskEnvelope {
    TaskEnvelope::for_work_item(&work_item(id, channel, 1_000), 4, 0)
}
