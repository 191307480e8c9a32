//! Work-source abstraction: where due reminders come from.

use async_trait::async_trait;

use crate::core::{CoreError, WorkItem};

/// Domain store of due work items.
///
/// The scheduler only reads items and marks them dispatched; it never
/// changes any other field.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Items due at or before `now_ms` that have not been marked dispatched.
    async fn list_due(&self, now_ms: u128) -> Result<Vec<WorkItem>, CoreError>;

    /// Mark an item as handed to the queue.
    async fn mark_dispatched(&self, work_item_id: &str) -> Result<(), CoreError>;
}
