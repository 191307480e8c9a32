//! Work items, notification payloads, and queued task envelopes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{ChannelError, FailureKind};
use crate::util::{duration_ms, reminder_key};

/// Due reminder description owned by the business domain.
///
/// The core reads it and never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Domain identifier of the item.
    pub id: String,
    /// When the reminder is due, milliseconds since epoch.
    pub due_at: u128,
    /// Channel name, e.g. `email`, `sms`, `telegram`.
    pub channel: String,
    /// Address, phone number, or chat id.
    pub recipient: String,
    /// Rendered message body.
    pub message: String,
}

/// What to send, to whom, through which channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Originating work item id.
    pub work_item_id: String,
    /// Channel name used to resolve the provider.
    pub channel: String,
    /// Recipient handle.
    pub recipient: String,
    /// Message body.
    pub message: String,
}

impl NotificationPayload {
    /// Reject payloads no provider could deliver.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PermanentValidation`] for an empty channel,
    /// recipient, or message.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.channel.trim().is_empty() {
            return Err(ChannelError::PermanentValidation("channel is empty".into()));
        }
        if self.recipient.trim().is_empty() {
            return Err(ChannelError::PermanentValidation("recipient is empty".into()));
        }
        if self.message.is_empty() {
            return Err(ChannelError::PermanentValidation("message is empty".into()));
        }
        Ok(())
    }
}

impl From<&WorkItem> for NotificationPayload {
    fn from(item: &WorkItem) -> Self {
        Self {
            work_item_id: item.id.clone(),
            channel: item.channel.clone(),
            recipient: item.recipient.clone(),
            message: item.message.clone(),
        }
    }
}

/// One failed attempt, kept for dead-letter diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number that failed (0-based).
    pub attempt: u32,
    /// Classified failure.
    pub failure: FailureKind,
    /// Error message reported by the provider adapter or the breaker.
    pub error: String,
    /// When the failure was observed.
    pub failed_at: u128,
}

/// One queued attempt to deliver a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Unique per attempt; retries get a fresh id.
    pub task_id: Uuid,
    /// Deterministic key shared by every attempt for one due occurrence.
    pub idempotency_key: String,
    /// What to send.
    pub payload: NotificationPayload,
    /// Attempts already made before this one.
    pub attempt_count: u32,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Earliest time a consumer may receive this envelope.
    pub not_before: u128,
    /// Failures of earlier attempts, oldest first.
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl TaskEnvelope {
    /// Fresh first-attempt envelope for a due work item.
    #[must_use]
    pub fn for_work_item(item: &WorkItem, max_attempts: u32, now_ms: u128) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            idempotency_key: reminder_key(&item.id, item.due_at),
            payload: NotificationPayload::from(item),
            attempt_count: 0,
            max_attempts,
            not_before: now_ms,
            history: Vec::new(),
        }
    }

    /// Append a failure of the current attempt to the history.
    pub fn record_failure(&mut self, failure: FailureKind, error: impl Into<String>, now_ms: u128) {
        self.history.push(AttemptRecord {
            attempt: self.attempt_count,
            failure,
            error: error.into(),
            failed_at: now_ms,
        });
    }

    /// Envelope for the next attempt after a failure of this one.
    ///
    /// The failure must already be recorded with [`record_failure`](Self::record_failure).
    #[must_use]
    pub fn next_attempt(&self, now_ms: u128, delay: Duration) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            idempotency_key: self.idempotency_key.clone(),
            payload: self.payload.clone(),
            attempt_count: self.attempt_count + 1,
            max_attempts: self.max_attempts,
            not_before: now_ms + duration_ms(delay),
            history: self.history.clone(),
        }
    }

    /// Last recorded error message, if any attempt failed.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.history.last().map(|r| r.error.as_str())
    }
}
