//! Idempotency ledger contract.
//!
//! The ledger is the one component that must be shared across every worker
//! process. A key is first *claimed* (atomic insert-if-absent), then either
//! *committed* with the send summary or *released* so a retry may claim it
//! again. Every claim names its owner, the task id of the delivery holding it.
//! A redelivery of the same task reclaims its own key, which is how a delivery
//! orphaned by a crashed worker resumes. Claims also carry a lease: a claim
//! older than the lease is treated as abandoned and any owner may take it over.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, SendSummary};

/// Proof that an idempotency key completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Key of the completed occurrence.
    pub idempotency_key: String,
    /// Completion time, milliseconds since epoch.
    pub completed_at: u128,
    /// What the provider reported.
    pub result_summary: SendSummary,
}

/// Shared claim/commit store for idempotency keys.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Atomically claim `key` for `owner`.
    ///
    /// Returns `true` for exactly one owner among any number of concurrent
    /// claimants, `false` if the key is committed or held by another owner's
    /// live claim. A claim already held by `owner` is refreshed and returns `true`.
    async fn claim(&self, key: &str, owner: &str) -> Result<bool, CoreError>;

    /// Record completion of a claimed key. Committing a key twice keeps the first record.
    async fn commit(&self, key: &str, summary: &SendSummary) -> Result<(), CoreError>;

    /// Drop `owner`'s uncommitted claim so a later attempt may claim again.
    ///
    /// Committed keys and claims taken over by another owner are left untouched.
    async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError>;

    /// Completion record for `key`, if committed.
    async fn record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError>;

    /// Delete completion records older than `cutoff_ms`; returns how many were removed.
    async fn prune_completed_before(&self, cutoff_ms: u128) -> Result<usize, CoreError>;
}
