//! In-memory idempotency ledger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LedgerState, DEFAULT_CLAIM_LEASE};
use crate::core::{CoreError, IdempotencyLedger, IdempotencyRecord, SendSummary};
use crate::util::{duration_ms, Clock, SystemClock};

/// Process-local ledger for development and tests.
///
/// Claims are atomic across tasks and threads of one process only.
#[derive(Debug)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    claim_lease: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Empty ledger on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty ledger on an explicit clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            claim_lease: DEFAULT_CLAIM_LEASE,
            clock,
        }
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Number of committed keys.
    #[must_use]
    pub fn committed_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, super::Slot::Done(_)))
            .count()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn claim(&self, key: &str, owner: &str) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .state
            .lock()
            .try_claim(key, owner, now, duration_ms(self.claim_lease)))
    }

    async fn commit(&self, key: &str, summary: &SendSummary) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        self.state.lock().commit(key, summary, now);
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError> {
        self.state.lock().release(key, owner);
        Ok(())
    }

    async fn record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError> {
        Ok(self.state.lock().record(key))
    }

    async fn prune_completed_before(&self, cutoff_ms: u128) -> Result<usize, CoreError> {
        Ok(self.state.lock().prune(cutoff_ms))
    }
}
