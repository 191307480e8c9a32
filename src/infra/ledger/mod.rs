//! Idempotency ledger backends.
//!
//! The in-memory and file backends share [`LedgerState`], which implements
//! owner-aware claim/commit/release/prune over a key map. Callers hold a lock
//! around every call, which is what makes `claim` atomic.

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::{IdempotencyRecord, SendSummary};

pub use file::FileLedger;
pub use memory::InMemoryLedger;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;

/// Default lease after which an uncommitted claim may be taken over.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    Pending { owner: String, claimed_at: u128 },
    Done(IdempotencyRecord),
}

#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    pub(crate) slots: HashMap<String, Slot>,
}

impl LedgerState {
    pub(crate) fn try_claim(&mut self, key: &str, owner: &str, now: u128, lease_ms: u128) -> bool {
        match self.slots.get(key) {
            Some(Slot::Done(_)) => return false,
            Some(Slot::Pending { owner: holder, .. }) if holder == owner => {
                debug!(idempotency_key = %key, owner = %owner, "claim refreshed by its owner");
            }
            Some(Slot::Pending { owner: holder, claimed_at }) => {
                if now.saturating_sub(*claimed_at) < lease_ms {
                    return false;
                }
                warn!(
                    idempotency_key = %key,
                    previous_owner = %holder,
                    owner = %owner,
                    claimed_at_ms = %claimed_at,
                    "claim lease expired; taking over"
                );
            }
            None => {}
        }
        self.slots.insert(
            key.to_string(),
            Slot::Pending {
                owner: owner.to_string(),
                claimed_at: now,
            },
        );
        true
    }

    /// Returns the record that was stored, or `None` if the key was already committed.
    pub(crate) fn commit(&mut self, key: &str, summary: &SendSummary, now: u128) -> Option<IdempotencyRecord> {
        if let Some(Slot::Done(existing)) = self.slots.get(key) {
            warn!(
                idempotency_key = %key,
                completed_at_ms = %existing.completed_at,
                "key already committed; keeping the first record"
            );
            return None;
        }
        let record = IdempotencyRecord {
            idempotency_key: key.to_string(),
            completed_at: now,
            result_summary: summary.clone(),
        };
        self.slots.insert(key.to_string(), Slot::Done(record.clone()));
        Some(record)
    }

    pub(crate) fn release(&mut self, key: &str, owner: &str) -> bool {
        if matches!(self.slots.get(key), Some(Slot::Pending { owner: holder, .. }) if holder == owner) {
            self.slots.remove(key);
            return true;
        }
        false
    }

    pub(crate) fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        match self.slots.get(key) {
            Some(Slot::Done(record)) => Some(record.clone()),
            _ => None,
        }
    }

    pub(crate) fn prune(&mut self, cutoff: u128) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !matches!(slot, Slot::Done(record) if record.completed_at < cutoff));
        before - self.slots.len()
    }
}
