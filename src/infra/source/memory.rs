//! In-memory work source.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{CoreError, WorkItem, WorkSource};

#[derive(Debug, Default)]
struct SourceState {
    items: BTreeMap<String, WorkItem>,
    dispatched: HashSet<String>,
}

/// Work items held in memory, for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryWorkSource {
    state: Mutex<SourceState>,
}

impl InMemoryWorkSource {
    /// Empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an item. Replacing an item makes it eligible again.
    pub fn add(&self, item: WorkItem) {
        let mut state = self.state.lock();
        state.dispatched.remove(&item.id);
        state.items.insert(item.id.clone(), item);
    }

    /// Whether `mark_dispatched` was called for the item.
    #[must_use]
    pub fn is_dispatched(&self, work_item_id: &str) -> bool {
        self.state.lock().dispatched.contains(work_item_id)
    }

    /// Number of items marked dispatched.
    #[must_use]
    pub fn dispatched_count(&self) -> usize {
        self.state.lock().dispatched.len()
    }
}

#[async_trait]
impl WorkSource for InMemoryWorkSource {
    async fn list_due(&self, now_ms: u128) -> Result<Vec<WorkItem>, CoreError> {
        let state = self.state.lock();
        let mut due: Vec<WorkItem> = state
            .items
            .values()
            .filter(|item| item.due_at <= now_ms && !state.dispatched.contains(&item.id))
            .cloned()
            .collect();
        due.sort_by_key(|item| item.due_at);
        Ok(due)
    }

    async fn mark_dispatched(&self, work_item_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if !state.items.contains_key(work_item_id) {
            return Err(CoreError::Backend(format!("unknown work item: {work_item_id}")));
        }
        state.dispatched.insert(work_item_id.to_string());
        Ok(())
    }
}
