//! In-memory dead-letter store.

use parking_lot::Mutex;

use crate::core::{CoreError, DeadLetter, DeadLetterStore};

/// Simple in-memory dead-letter store for development/testing.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn deliver(&self, letter: DeadLetter) -> Result<(), CoreError> {
        self.letters.lock().push(letter);
        Ok(())
    }

    fn fetch(&self, since_ms: Option<u128>, limit: usize) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .iter()
            .filter(|l| since_ms.is_none_or(|s| l.dead_lettered_at >= s))
            .take(limit)
            .cloned()
            .collect()
    }
}
