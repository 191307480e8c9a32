//! Retry decisions for failed dispatch attempts.
//!
//! The policy is pure apart from jitter: it maps an attempt number and a
//! classified failure to "retry after a delay", "dead-letter", or "do not
//! retry". Sleeping is never done here; the dispatcher re-enqueues with the
//! returned delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{FailureKind, TaskEnvelope};

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the next attempt after `delay`.
    Retry {
        /// Delay before the next attempt becomes visible.
        delay: Duration,
    },
    /// Budget exhausted; park the task for operators.
    DeadLetter,
    /// Permanent failure; retrying cannot help.
    NoRetry,
}

/// Randomisation applied to exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Exact exponential delays.
    None,
    /// Uniform in `[delay / 2, delay]`.
    #[default]
    Equal,
}

impl Jitter {
    fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Equal => {
                let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                if ms < 2 {
                    return delay;
                }
                Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
            }
        }
    }
}

/// Exponential backoff with a cap and a per-envelope attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub backoff_base: Duration,
    /// Upper bound on any single delay.
    pub backoff_cap: Duration,
    /// Randomisation applied to transient-failure delays.
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            jitter: Jitter::Equal,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter.
    #[must_use]
    pub const fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            backoff_cap,
            jitter: Jitter::None,
        }
    }

    /// Replace the jitter mode.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after the failure of `attempt`: `min(base * 2^attempt, cap)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }

    /// Decide using this policy's own attempt budget.
    #[must_use]
    pub fn decide(&self, attempt: u32, failure: &FailureKind) -> RetryDecision {
        self.decide_with_budget(attempt, self.max_attempts, failure)
    }

    /// Decide for a failed envelope, using the budget it carries.
    #[must_use]
    pub fn decide_for(&self, envelope: &TaskEnvelope, failure: &FailureKind) -> RetryDecision {
        self.decide_with_budget(envelope.attempt_count, envelope.max_attempts, failure)
    }

    fn decide_with_budget(&self, attempt: u32, max_attempts: u32, failure: &FailureKind) -> RetryDecision {
        if !failure.is_retryable() {
            return RetryDecision::NoRetry;
        }
        if attempt.saturating_add(1) >= max_attempts {
            return RetryDecision::DeadLetter;
        }
        let delay = match failure {
            FailureKind::CircuitOpen { retry_after } => (*retry_after).max(Duration::from_millis(1)),
            _ => self.jitter.apply(self.backoff(attempt)),
        };
        RetryDecision::Retry { delay }
    }
}
