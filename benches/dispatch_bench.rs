//! Benchmarks for the dispatch hot paths.
//!
//! Benchmarks cover:
//! - Circuit breaker admission on a closed circuit
//! - Idempotency claims against the in-memory ledger
//! - Queue enqueue/consume/ack round trips
//! - Retry decisions and key derivation
//! - End-to-end dispatch of a batch through the in-memory backends

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_dispatch::core::{
    BreakerConfig, ChannelError, ChannelProvider, ChannelRouter, CircuitBreakerRegistry,
    FailureKind, IdempotencyLedger, NotificationDispatcher, RetryPolicy, SendSummary,
    TaskEnvelope, TaskQueueClient, WorkItem,
};
use prometheus_dispatch::infra::{InMemoryDeadLetterStore, InMemoryLedger, InMemoryTaskQueue};
use prometheus_dispatch::util::reminder_key;
use tokio::runtime::Runtime;

// ============================================================================
// Bench Channel
// ============================================================================

struct NoopChannel;

#[async_trait]
impl ChannelProvider for NoopChannel {
    fn channel(&self) -> &str {
        "email"
    }

    async fn send(&self, _recipient: &str, _message: &str) -> Result<SendSummary, ChannelError> {
        Ok(SendSummary::new("sent"))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn build_envelope(id: u64) -> TaskEnvelope {
    let item = WorkItem {
        id: format!("task-{id}"),
        due_at: 1_700_000_000_000 + u128::from(id),
        channel: "email".into(),
        recipient: format!("user-{}@example.com", id % 10),
        message: "Your task is due".into(),
    };
    TaskEnvelope::for_work_item(&item, 4, 0)
}

fn build_dispatcher(queue: Arc<InMemoryTaskQueue>) -> NotificationDispatcher {
    NotificationDispatcher::new(
        queue,
        Arc::new(InMemoryLedger::new()),
        Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
        RetryPolicy::default(),
        ChannelRouter::new().with_provider(Arc::new(NoopChannel)),
        Arc::new(InMemoryDeadLetterStore::new()),
    )
}

// ============================================================================
// Breaker and Ledger
// ============================================================================

fn bench_breaker_guard_closed(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
    let registry = &registry;

    c.bench_function("breaker_guard_closed", |b| {
        b.to_async(&rt).iter(|| async move {
            let result = registry
                .guard("email-provider", || async { Ok::<_, String>(1u32) })
                .await;
            black_box(result)
        });
    });
}

fn bench_ledger_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_claim");
    let rt = Runtime::new().unwrap();

    for size in [100u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let ledger = InMemoryLedger::new();
                for i in 0..size {
                    let key = format!("key-{i}");
                    black_box(ledger.claim(&key, "bench").await.unwrap());
                    ledger.commit(&key, &SendSummary::new("sent")).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Queue
// ============================================================================

fn bench_queue_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_round_trip");
    let rt = Runtime::new().unwrap();

    for size in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let queue = InMemoryTaskQueue::new(10_000);
                for i in 0..size {
                    queue.enqueue(build_envelope(i), Duration::ZERO).await.unwrap();
                }
                while let Some(delivery) = queue.consume(Duration::ZERO).await.unwrap() {
                    queue.ack(&delivery.receipt).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Retry and Keys
// ============================================================================

fn bench_retry_decide(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    let failure = FailureKind::TransientChannel;

    c.bench_function("retry_decide", |b| {
        b.iter(|| {
            for attempt in 0..4 {
                black_box(policy.decide(black_box(attempt), &failure));
            }
        });
    });
}

fn bench_reminder_key(c: &mut Criterion) {
    c.bench_function("reminder_key", |b| {
        b.iter(|| black_box(reminder_key(black_box("task-12345"), black_box(1_700_000_000_000))));
    });
}

// ============================================================================
// End-to-End Dispatch
// ============================================================================

fn bench_dispatch_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_batch");
    let rt = Runtime::new().unwrap();

    for size in [10u64, 100] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let queue = Arc::new(InMemoryTaskQueue::new(10_000));
                let dispatcher = build_dispatcher(Arc::clone(&queue));
                for i in 0..size {
                    queue.enqueue(build_envelope(i), Duration::ZERO).await.unwrap();
                }
                while let Some(delivery) = queue.consume(Duration::ZERO).await.unwrap() {
                    black_box(dispatcher.process(delivery).await);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_breaker_guard_closed,
    bench_ledger_claim,
    bench_queue_round_trip,
    bench_retry_decide,
    bench_reminder_key,
    bench_dispatch_batch,
);
criterion_main!(benches);
