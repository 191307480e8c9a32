//! Error types and the failure taxonomy used for retry decisions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by queue, ledger, work-source and dead-letter backends.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Ack/nack for a delivery the queue no longer tracks (already acked or redelivered).
    #[error("unknown receipt: {0}")]
    UnknownReceipt(String),
    /// Configuration rejected during assembly.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Storage call exceeded the task hard limit.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Failure reported by a channel provider adapter.
///
/// Adapters classify every failure; the dispatcher never inspects provider
/// specific error values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Network or provider hiccup; retryable.
    #[error("transient channel error: {0}")]
    Transient(String),
    /// Bad recipient or malformed payload; retrying cannot help.
    #[error("permanent validation error: {0}")]
    PermanentValidation(String),
}

impl ChannelError {
    /// Whether this failure says anything about the provider's health.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Failure kind used by the retry policy.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::TransientChannel,
            Self::PermanentValidation(_) => FailureKind::PermanentValidation,
        }
    }
}

/// Error returned by [`CircuitBreakerRegistry::guard`](crate::core::CircuitBreakerRegistry::guard).
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The circuit rejected the call; the wrapped operation was not invoked.
    #[error("circuit open for {service}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Guarded service name.
        service: String,
        /// Time left before the breaker admits a trial call.
        retry_after: Duration,
        /// Rejected because the circuit is half-open and its trial slots are
        /// taken, not because the recovery window is still running.
        trial_in_flight: bool,
    },
    /// The operation ran and returned its own error.
    #[error("{0}")]
    Inner(E),
}

/// Classified failure of one dispatch attempt.
///
/// Retry decisions are made by inspecting this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Provider hiccup, including sends aborted at the hard time limit.
    TransientChannel,
    /// Bad input; dead-lettered without consuming retry budget.
    PermanentValidation,
    /// Fail-fast rejection by an open circuit; no attempt was made.
    CircuitOpen {
        /// Remaining recovery window when the call was rejected.
        retry_after: Duration,
    },
}

impl FailureKind {
    /// Whether the retry policy may schedule another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::PermanentValidation)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientChannel => write!(f, "transient_channel"),
            Self::PermanentValidation => write!(f, "permanent_validation"),
            Self::CircuitOpen { .. } => write!(f, "circuit_open"),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
