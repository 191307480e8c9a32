//! Task queue client contract.
//!
//! Semantics are at-least-once: a delivery stays invisible to other consumers
//! until it is acked, nacked, or its visibility deadline passes. A worker that
//! dies mid-task therefore causes redelivery, never loss.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{CoreError, TaskEnvelope};

/// Handle for acknowledging one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
    /// Queue-assigned id of this particular delivery.
    pub delivery_id: u64,
    /// Envelope task id, for logging.
    pub task_id: Uuid,
}

/// One envelope handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The queued attempt.
    pub envelope: TaskEnvelope,
    /// Ack/nack handle.
    pub receipt: Receipt,
    /// `true` when a previous delivery of this envelope was never acknowledged.
    pub redelivered: bool,
}

/// Client for a durable at-least-once task queue.
#[async_trait]
pub trait TaskQueueClient: Send + Sync {
    /// Make `envelope` visible to consumers after `delay`.
    async fn enqueue(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), CoreError>;

    /// Wait up to `wait` for a visible envelope.
    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, CoreError>;

    /// Remove a delivered envelope for good.
    async fn ack(&self, receipt: &Receipt) -> Result<(), CoreError>;

    /// Return a delivered envelope; it becomes visible again after `delay`.
    async fn nack(&self, receipt: &Receipt, delay: Duration) -> Result<(), CoreError>;

    /// Envelopes not yet acknowledged, including in-flight ones.
    async fn depth(&self) -> Result<usize, CoreError>;
}
