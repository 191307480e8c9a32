//! Integration tests for the idempotency ledger backends
//!
//! These tests validate:
//! - Exactly one winner among sequential and concurrent claimants
//! - Commit-once semantics and the stored summary
//! - Release making a key claimable again, for the claim's owner only
//! - A redelivered task reclaiming its own key
//! - Durability of the file backend across reopen

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use prometheus_dispatch::core::{IdempotencyLedger, SendSummary};
use prometheus_dispatch::infra::{FileLedger, InMemoryLedger};
use prometheus_dispatch::util::reminder_key;

async fn race(ledger: Arc<dyn IdempotencyLedger>, key: &str, contenders: usize) -> usize {
    let handles = (0..contenders).map(|i| {
        let ledger = Arc::clone(&ledger);
        let key = key.to_string();
        tokio::spawn(async move { ledger.claim(&key, &format!("task-{i}")).await })
    });
    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("claim failed"))
        .filter(|won| *won)
        .count()
}

#[tokio::test]
async fn test_sequential_claims_win_once() {
    let ledger = InMemoryLedger::new();
    let key = reminder_key("task-1", 1_700_000_000_000);
    assert!(ledger.claim(&key, "a").await.unwrap());
    assert!(!ledger.claim(&key, "b").await.unwrap());
    assert!(!ledger.claim(&key, "c").await.unwrap());
}

#[tokio::test]
async fn test_owner_reclaims_after_redelivery() {
    let ledger = InMemoryLedger::new();
    let key = reminder_key("task-4", 1_700_000_000_000);
    assert!(ledger.claim(&key, "delivery-1").await.unwrap());
    assert!(ledger.claim(&key, "delivery-1").await.unwrap());
    assert!(!ledger.claim(&key, "delivery-2").await.unwrap());

    ledger.commit(&key, &SendSummary::new("sent")).await.unwrap();
    assert!(!ledger.claim(&key, "delivery-1").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_win_once_in_memory() {
    let ledger: Arc<dyn IdempotencyLedger> = Arc::new(InMemoryLedger::new());
    let key = reminder_key("task-2", 1_700_000_000_000);
    assert_eq!(race(ledger, &key, 32).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_win_once_file() {
    let dir = tempfile::tempdir().unwrap();
    let ledger: Arc<dyn IdempotencyLedger> = Arc::new(FileLedger::open(dir.path(), "race").unwrap());
    let key = reminder_key("task-3", 1_700_000_000_000);
    assert_eq!(race(ledger, &key, 32).await, 1);
}

#[tokio::test]
async fn test_commit_keeps_first_summary() {
    let ledger = InMemoryLedger::new();
    let first = SendSummary::new("sent").with_provider_ref("smtp-42");
    assert!(ledger.claim("k", "a").await.unwrap());
    ledger.commit("k", &first).await.unwrap();
    ledger.commit("k", &SendSummary::new("second")).await.unwrap();

    let record = ledger.record("k").await.unwrap().unwrap();
    assert_eq!(record.result_summary, first);
    assert_eq!(ledger.committed_count(), 1);
}

#[tokio::test]
async fn test_release_allows_reclaim_but_not_after_commit() {
    let ledger = InMemoryLedger::new();
    assert!(ledger.claim("k", "a").await.unwrap());
    ledger.release("k", "other").await.unwrap();
    assert!(!ledger.claim("k", "b").await.unwrap(), "only the owner releases");
    ledger.release("k", "a").await.unwrap();
    assert!(ledger.claim("k", "b").await.unwrap());
    ledger.commit("k", &SendSummary::new("sent")).await.unwrap();
    ledger.release("k", "b").await.unwrap();
    assert!(!ledger.claim("k", "c").await.unwrap());
    assert!(ledger.record("k").await.unwrap().is_some());
}

#[tokio::test]
async fn test_file_ledger_pending_claim_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ledger = FileLedger::open(dir.path(), "restart").unwrap();
        assert!(ledger.claim("in-flight", "crashed").await.unwrap());
    }
    let reopened = FileLedger::open(dir.path(), "restart")
        .unwrap()
        .with_claim_lease(Duration::from_secs(600));
    assert!(
        !reopened.claim("in-flight", "duplicate").await.unwrap(),
        "claim held by a crashed worker stays exclusive until its lease expires"
    );
    assert!(
        reopened.claim("in-flight", "crashed").await.unwrap(),
        "redelivery of the crashed task resumes its claim"
    );

    let expired = FileLedger::open(dir.path(), "restart")
        .unwrap()
        .with_claim_lease(Duration::ZERO);
    assert!(expired.claim("in-flight", "duplicate").await.unwrap());
}
