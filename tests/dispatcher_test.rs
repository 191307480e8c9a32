//! Integration tests for the notification dispatcher
//!
//! These tests validate real dispatch flows against in-memory backends:
//! - Successful send commits the provider's summary
//! - Transient failures retry with backoff until the budget is exhausted
//! - Permanent failures dead-letter immediately
//! - Open circuits defer the task by the breaker's retry-after
//! - Duplicate deliveries are acked without sending
//! - A delivery orphaned by a crashed worker is sent when it is redelivered
//! - A half-open trial in flight defers other tasks without using attempts
//! - Sends exceeding the hard time limit count as transient failures

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{envelope, Harness, MockChannel};
use prometheus_dispatch::core::{
    AuditAction, BreakerConfig, ChannelError, CircuitState, DeadLetterStore, DispatchLimits,
    DispatchOutcome, FailureKind, IdempotencyLedger, RetryPolicy, SendSummary, TaskEnvelope,
    TaskQueueClient,
};
use prometheus_dispatch::infra::InMemoryTaskQueue;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

async fn deliver(h: &Harness, env: TaskEnvelope) -> DispatchOutcome {
    h.queue.enqueue(env, Duration::ZERO).await.unwrap();
    next(h).await.expect("envelope should be visible")
}

async fn next(h: &Harness) -> Option<DispatchOutcome> {
    let delivery = h.queue.consume(Duration::ZERO).await.unwrap()?;
    Some(h.dispatcher.process(delivery).await)
}

// ============================================================================
// SUCCESS AND DUPLICATES
// ============================================================================

#[tokio::test]
async fn test_success_commits_returned_summary() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());
    let env = envelope("t-1", "email");
    let key = env.idempotency_key.clone();

    let outcome = deliver(&h, env).await;
    let expected = SendSummary::new("sent").with_provider_ref("mock-1");
    assert_eq!(outcome, DispatchOutcome::Sent(expected.clone()));

    let record = h.ledger.record(&key).await.unwrap().unwrap();
    assert_eq!(record.result_summary, expected);
    assert_eq!(provider.calls(), 1);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.audit.events_with(AuditAction::Sent).len(), 1);
    assert_eq!(h.dispatcher.stats().sent, 1);
}

#[tokio::test]
async fn test_redelivered_envelope_is_acked_without_sending() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());
    let env = envelope("t-2", "email");

    assert!(matches!(deliver(&h, env.clone()).await, DispatchOutcome::Sent(_)));
    assert_eq!(deliver(&h, env).await, DispatchOutcome::Duplicate);

    assert_eq!(provider.calls(), 1);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.dispatcher.stats().duplicates, 1);
    assert_eq!(h.audit.events_with(AuditAction::Duplicate).len(), 1);
}

#[tokio::test]
async fn test_live_claim_by_other_worker_skips_send() {
    let provider = Arc::new(MockChannel::ok("sms"));
    let h = Harness::new(provider.clone());
    let env = envelope("t-3", "sms");
    assert!(h.ledger.claim(&env.idempotency_key, "other-task").await.unwrap());

    assert_eq!(deliver(&h, env).await, DispatchOutcome::Duplicate);
    assert_eq!(provider.calls(), 0);
}

// ============================================================================
// CRASH RECOVERY
// ============================================================================

#[tokio::test]
async fn test_redelivery_after_worker_crash_sends_once() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());
    let env = envelope("t-crash", "email");
    let key = env.idempotency_key.clone();
    h.queue.enqueue(env, Duration::ZERO).await.unwrap();

    // Worker claims the key, then dies before sending, committing or acking.
    let orphaned = h.queue.consume(Duration::ZERO).await.unwrap().unwrap();
    let owner = orphaned.envelope.task_id.to_string();
    assert!(h.ledger.claim(&key, &owner).await.unwrap());
    drop(orphaned);

    h.clock.advance(InMemoryTaskQueue::DEFAULT_VISIBILITY_TIMEOUT);
    let redelivery = h.queue.consume(Duration::ZERO).await.unwrap().unwrap();
    assert!(redelivery.redelivered);

    let outcome = h.dispatcher.process(redelivery).await;
    assert!(matches!(outcome, DispatchOutcome::Sent(_)), "{outcome:?}");
    assert_eq!(provider.calls(), 1);
    assert!(h.ledger.record(&key).await.unwrap().is_some());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.dispatcher.stats().redelivered, 1);

    h.clock.advance(Duration::from_secs(3_600));
    assert!(next(&h).await.is_none());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_stale_worker_cannot_release_taken_over_claim() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());
    let env = envelope("t-stale", "email");
    let key = env.idempotency_key.clone();

    assert!(h.ledger.claim(&key, "stale-task").await.unwrap());
    h.clock.advance(Duration::from_secs(600));
    assert!(h.ledger.claim(&key, "live-task").await.unwrap());

    h.ledger.release(&key, "stale-task").await.unwrap();
    assert_eq!(deliver(&h, env).await, DispatchOutcome::Duplicate);
    assert_eq!(provider.calls(), 0);
}

// ============================================================================
// RETRIES AND DEAD LETTERS
// ============================================================================

#[tokio::test]
async fn test_transient_failure_schedules_backoff_retry() {
    let provider = Arc::new(MockChannel::failing("email"));
    let h = Harness::new(provider.clone());
    let env = envelope("t-4", "email");
    let key = env.idempotency_key.clone();

    let outcome = deliver(&h, env).await;
    assert_eq!(
        outcome,
        DispatchOutcome::RetryScheduled {
            attempt: 1,
            delay: Duration::from_secs(1)
        }
    );

    let pending = h.queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 1);
    assert_eq!(pending[0].idempotency_key, key);
    assert_eq!(pending[0].history.len(), 1);
    assert_eq!(pending[0].history[0].failure, FailureKind::TransientChannel);

    assert!(h.ledger.claim(&key, "next-task").await.unwrap(), "claim released after failure");
}

#[tokio::test]
async fn test_budget_exhaustion_dead_letters_without_further_enqueue() {
    let provider = Arc::new(MockChannel::failing("email"));
    let h = Harness::new(provider.clone());

    let mut outcomes = vec![deliver(&h, envelope("t-5", "email")).await];
    while let DispatchOutcome::RetryScheduled { delay, .. } = outcomes[outcomes.len() - 1] {
        h.clock.advance(delay);
        outcomes.push(next(&h).await.expect("retry should be visible after its delay"));
    }

    let delays: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            DispatchOutcome::RetryScheduled { delay, .. } => Some(delay.as_secs()),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1, 2, 4]);
    assert_eq!(
        outcomes.last(),
        Some(&DispatchOutcome::DeadLettered(FailureKind::TransientChannel))
    );
    assert_eq!(provider.calls(), 4);
    assert_eq!(h.queue.depth().await.unwrap(), 0);

    let letters = h.dead_letters.fetch(None, 10);
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].envelope.attempt_count, 3);
    assert_eq!(letters[0].envelope.history.len(), 4);
    assert_eq!(letters[0].last_error, "transient channel error: provider unavailable");
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_immediately() {
    let provider = Arc::new(MockChannel::with_fallback(
        "sms",
        Err(ChannelError::PermanentValidation("invalid phone number".into())),
    ));
    let h = Harness::new(provider.clone());
    let env = envelope("t-6", "sms");
    let key = env.idempotency_key.clone();

    let outcome = deliver(&h, env).await;
    assert_eq!(outcome, DispatchOutcome::DeadLettered(FailureKind::PermanentValidation));
    assert_eq!(provider.calls(), 1);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.dead_letters.fetch(None, 10)[0].envelope.attempt_count, 0);
    assert!(h.ledger.record(&key).await.unwrap().is_none());
    assert_eq!(h.audit.events_with(AuditAction::DeadLettered).len(), 1);
}

#[tokio::test]
async fn test_invalid_payload_is_never_sent() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());
    let mut env = envelope("t-7", "email");
    env.payload.recipient = String::new();
    let key = env.idempotency_key.clone();

    let outcome = deliver(&h, env).await;
    assert_eq!(outcome, DispatchOutcome::DeadLettered(FailureKind::PermanentValidation));
    assert_eq!(provider.calls(), 0);
    assert!(h.ledger.claim(&key, "next-task").await.unwrap(), "validation failures never claim");
}

#[tokio::test]
async fn test_unknown_channel_dead_letters() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());

    let outcome = deliver(&h, envelope("t-8", "pager")).await;
    assert_eq!(outcome, DispatchOutcome::DeadLettered(FailureKind::PermanentValidation));
    assert!(h.dead_letters.fetch(None, 1)[0].last_error.contains("unknown channel: pager"));
}

// ============================================================================
// CIRCUIT BREAKER INTEGRATION
// ============================================================================

#[tokio::test]
async fn test_open_circuit_defers_by_retry_after() {
    let provider = Arc::new(MockChannel::ok("email"));
    let h = Harness::new(provider.clone());
    h.registry.force_open("email-provider");
    h.clock.advance(Duration::from_secs(20));

    let outcome = deliver(&h, envelope("t-9", "email")).await;
    assert_eq!(
        outcome,
        DispatchOutcome::RetryScheduled {
            attempt: 1,
            delay: Duration::from_secs(40)
        }
    );
    assert_eq!(provider.calls(), 0);
    let pending = h.queue.pending();
    assert!(matches!(pending[0].history[0].failure, FailureKind::CircuitOpen { .. }));
}

#[tokio::test]
async fn test_half_open_trial_in_flight_defers_without_using_attempts() {
    let provider = Arc::new(MockChannel::ok("email").with_delay(Duration::from_millis(500)));
    let h = Harness::new(provider.clone());
    h.registry.force_open("email-provider");
    h.clock.advance(Duration::from_secs(61));

    h.queue.enqueue(envelope("trial", "email"), Duration::ZERO).await.unwrap();
    h.queue.enqueue(envelope("waiting", "email"), Duration::ZERO).await.unwrap();
    let trial = h.queue.consume(Duration::ZERO).await.unwrap().unwrap();

    let (trial_outcome, deferrals) = tokio::join!(h.dispatcher.process(trial), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(next(&h).await.expect("deferred task visible again"));
            h.clock.advance(Duration::from_secs(1));
        }
        outcomes
    });

    assert!(matches!(trial_outcome, DispatchOutcome::Sent(_)));
    assert!(deferrals.iter().all(|o| *o
        == DispatchOutcome::Deferred {
            delay: Duration::from_secs(1)
        }));
    assert_eq!(h.dispatcher.stats().deferred, 6);
    assert!(h.dead_letters.fetch(None, 10).is_empty());

    let pending = h.queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 0);
    assert!(pending[0].history.is_empty());

    assert!(matches!(next(&h).await, Some(DispatchOutcome::Sent(_))));
    assert_eq!(provider.calls(), 2);
    assert_eq!(h.registry.snapshot("email-provider").state, CircuitState::Closed);
}

#[tokio::test]
async fn test_transient_failures_trip_breaker_for_later_tasks() {
    let provider = Arc::new(MockChannel::failing("email"));
    let breaker = BreakerConfig {
        failure_threshold: 2,
        ..BreakerConfig::default()
    };
    let h = Harness::with(
        provider.clone(),
        breaker,
        RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(300)),
    );

    deliver(&h, envelope("a", "email")).await;
    deliver(&h, envelope("b", "email")).await;
    let outcome = deliver(&h, envelope("c", "email")).await;

    assert_eq!(provider.calls(), 2);
    assert_eq!(
        outcome,
        DispatchOutcome::RetryScheduled {
            attempt: 1,
            delay: Duration::from_secs(60)
        }
    );
}

#[tokio::test]
async fn test_permanent_errors_do_not_trip_breaker() {
    let provider = Arc::new(MockChannel::with_fallback(
        "sms",
        Err(ChannelError::PermanentValidation("bad number".into())),
    ));
    let breaker = BreakerConfig {
        failure_threshold: 1,
        ..BreakerConfig::default()
    };
    let h = Harness::with(provider.clone(), breaker, RetryPolicy::default());

    deliver(&h, envelope("a", "sms")).await;
    deliver(&h, envelope("b", "sms")).await;
    assert_eq!(provider.calls(), 2);
    assert_eq!(h.registry.snapshot("sms-provider").consecutive_failures, 0);
}

// ============================================================================
// TIME LIMITS
// ============================================================================

#[tokio::test]
async fn test_hard_limit_aborts_send_as_transient() {
    let provider = Arc::new(MockChannel::ok("email").with_delay(Duration::from_secs(5)));
    let h = Harness::new(provider.clone());
    let h = Harness {
        dispatcher: h.dispatcher.with_limits(DispatchLimits {
            soft_limit: Duration::from_millis(20),
            hard_limit: Duration::from_millis(60),
            ledger_retry_delay: Duration::from_secs(1),
        }),
        ..h
    };

    let outcome = deliver(&h, envelope("slow", "email")).await;
    assert!(matches!(outcome, DispatchOutcome::RetryScheduled { attempt: 1, .. }));
    let pending = h.queue.pending();
    assert!(pending[0].history[0].error.contains("hard time limit"));
}
