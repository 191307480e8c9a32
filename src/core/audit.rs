//! Audit trail of dispatch lifecycle events.
//!
//! Events carry identifiers only, never recipients or message bodies.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::TaskEnvelope;
use crate::util::clock::now_ms;

/// Lifecycle step being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Scheduler put a first attempt on the queue.
    Enqueued,
    /// Provider accepted the notification and the key was committed.
    Sent,
    /// Delivery skipped because the key was already claimed or committed.
    Duplicate,
    /// Failure with a follow-up attempt scheduled.
    RetryScheduled,
    /// Task parked in the dead-letter store.
    DeadLettered,
    /// Ledger claim dropped after a failed attempt.
    Released,
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Envelope task id.
    pub task_id: Uuid,
    /// Idempotency key of the occurrence.
    pub idempotency_key: String,
    /// Originating work item id.
    pub work_item_id: String,
    /// Action taken.
    pub action: AuditAction,
    /// Attempt number of the envelope.
    pub attempt: u32,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
#[derive(Debug)]
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events with the given action.
    #[must_use]
    pub fn events_with(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build an audit event for an envelope.
#[must_use]
pub fn build_audit_event(envelope: &TaskEnvelope, action: AuditAction, detail: Option<String>) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        task_id: envelope.task_id,
        idempotency_key: envelope.idempotency_key.clone(),
        work_item_id: envelope.payload.work_item_id.clone(),
        action,
        attempt: envelope.attempt_count,
        created_at_ms: now_ms(),
        detail,
    }
}
