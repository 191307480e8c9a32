//! Deterministic idempotency key derivation.

use sha2::{Digest, Sha256};

/// Prefix shared by every reminder idempotency key.
pub const REMINDER_KEY_PREFIX: &str = "reminder";

/// Derive the idempotency key for one due occurrence of a work item.
///
/// The key depends only on the work item id and its due timestamp, never on
/// the time of the sweep, so every sweep that sees the same occurrence
/// produces the same key. Rescheduling an item to a new `due_at_ms` yields a
/// new key and therefore a new delivery.
#[must_use]
pub fn reminder_key(work_item_id: &str, due_at_ms: u128) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_item_id.as_bytes());
    // NUL separator between id and timestamp.
    hasher.update([0u8]);
    hasher.update(due_at_ms.to_be_bytes());
    format!("{REMINDER_KEY_PREFIX}:{:x}", hasher.finalize())
}
