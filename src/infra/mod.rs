//! Infrastructure adapters for queues, ledgers, work sources, dead letters and channels.

pub mod channel;
pub mod dead_letter;
pub mod ledger;
pub mod queue;
pub mod source;

pub use channel::LoggingChannel;
pub use dead_letter::{FileDeadLetterStore, InMemoryDeadLetterStore};
pub use ledger::{FileLedger, InMemoryLedger};
#[cfg(feature = "postgres")]
pub use ledger::PostgresLedger;
pub use queue::{InMemoryTaskQueue, QueueStats};
pub use source::InMemoryWorkSource;
