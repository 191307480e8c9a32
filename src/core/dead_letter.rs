//! Dead-letter records for tasks that exhausted their retry budget or failed permanently.

use serde::{Deserialize, Serialize};

use crate::core::{CoreError, FailureKind, TaskEnvelope};

/// A task parked for operator attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Final envelope, including the full attempt history.
    pub envelope: TaskEnvelope,
    /// Failure that ended the task.
    pub failure: FailureKind,
    /// Error message of the final attempt.
    pub last_error: String,
    /// When the task was dead-lettered.
    pub dead_lettered_at: u128,
}

/// Destination for dead-lettered tasks.
pub trait DeadLetterStore: Send + Sync {
    /// Persist a dead letter.
    fn deliver(&self, letter: DeadLetter) -> Result<(), CoreError>;

    /// Dead letters recorded at or after `since_ms`, oldest first, at most `limit`.
    fn fetch(&self, since_ms: Option<u128>, limit: usize) -> Vec<DeadLetter>;
}
