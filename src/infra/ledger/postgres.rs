//! Postgres-backed idempotency ledger, shared by every worker process.
//!
//! `claim` is a single `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement:
//! the row is created, refreshed by its owner, or taken over once its lease
//! expired, and exactly one concurrent caller sees an affected row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::DEFAULT_CLAIM_LEASE;
use crate::core::{CoreError, IdempotencyLedger, IdempotencyRecord, SendSummary};
use crate::util::{duration_ms, Clock, SystemClock};

fn backend<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::Backend(err.to_string())
}

fn to_db_ms(ms: u128) -> Result<i64, CoreError> {
    i64::try_from(ms).map_err(backend)
}

/// Ledger stored in the `dispatch_idempotency` table.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    claim_lease: Duration,
    clock: Arc<dyn Clock>,
}

impl PostgresLedger {
    /// Ledger over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_lease: DEFAULT_CLAIM_LEASE,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Returns SQL migration statements for the ledger table.
    #[must_use]
    pub const fn migrations() -> &'static [&'static str] {
        &[
            r"
CREATE TABLE IF NOT EXISTS dispatch_idempotency (
    idempotency_key TEXT PRIMARY KEY,
    claimed_by TEXT NOT NULL DEFAULT '',
    claimed_at_ms BIGINT NOT NULL,
    completed_at_ms BIGINT,
    result_summary TEXT
);
CREATE INDEX IF NOT EXISTS idx_dispatch_idempotency_completed ON dispatch_idempotency (completed_at_ms);
",
            r"
ALTER TABLE dispatch_idempotency ADD COLUMN IF NOT EXISTS claimed_by TEXT NOT NULL DEFAULT '';
",
        ]
    }

    /// Run the migrations against the pool.
    ///
    /// # Errors
    ///
    /// [`CoreError::Backend`] on any database error.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        for statement in Self::migrations() {
            sqlx::raw_sql(statement).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresLedger {
    async fn claim(&self, key: &str, owner: &str) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        let stale_before = to_db_ms(now.saturating_sub(duration_ms(self.claim_lease)))?;
        let result = sqlx::query(
            "INSERT INTO dispatch_idempotency (idempotency_key, claimed_by, claimed_at_ms) VALUES ($1, $2, $3) \
             ON CONFLICT (idempotency_key) DO UPDATE \
             SET claimed_by = EXCLUDED.claimed_by, claimed_at_ms = EXCLUDED.claimed_at_ms \
             WHERE dispatch_idempotency.completed_at_ms IS NULL \
             AND (dispatch_idempotency.claimed_by = $2 OR dispatch_idempotency.claimed_at_ms <= $4)",
        )
        .bind(key)
        .bind(owner)
        .bind(to_db_ms(now)?)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(&self, key: &str, summary: &SendSummary) -> Result<(), CoreError> {
        let now = to_db_ms(self.clock.now_ms())?;
        let summary = serde_json::to_string(summary).map_err(backend)?;
        sqlx::query(
            "INSERT INTO dispatch_idempotency (idempotency_key, claimed_at_ms, completed_at_ms, result_summary) \
             VALUES ($1, $2, $2, $3) \
             ON CONFLICT (idempotency_key) DO UPDATE \
             SET completed_at_ms = EXCLUDED.completed_at_ms, result_summary = EXCLUDED.result_summary \
             WHERE dispatch_idempotency.completed_at_ms IS NULL",
        )
        .bind(key)
        .bind(now)
        .bind(summary)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError> {
        sqlx::query(
            "DELETE FROM dispatch_idempotency \
             WHERE idempotency_key = $1 AND claimed_by = $2 AND completed_at_ms IS NULL",
        )
        .bind(key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError> {
        let row = sqlx::query(
            "SELECT completed_at_ms, result_summary FROM dispatch_idempotency \
             WHERE idempotency_key = $1 AND completed_at_ms IS NOT NULL",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let completed_at: i64 = row.try_get("completed_at_ms").map_err(backend)?;
        let summary: String = row.try_get("result_summary").map_err(backend)?;
        Ok(Some(IdempotencyRecord {
            idempotency_key: key.to_string(),
            completed_at: u128::try_from(completed_at).map_err(backend)?,
            result_summary: serde_json::from_str(&summary).map_err(backend)?,
        }))
    }

    async fn prune_completed_before(&self, cutoff_ms: u128) -> Result<usize, CoreError> {
        let result = sqlx::query(
            "DELETE FROM dispatch_idempotency WHERE completed_at_ms IS NOT NULL AND completed_at_ms < $1",
        )
        .bind(to_db_ms(cutoff_ms.min(u128::from(u64::MAX >> 1)))?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        usize::try_from(result.rows_affected()).map_err(backend)
    }
}
