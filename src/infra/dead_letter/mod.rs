//! Dead-letter store backends.

pub mod file;
pub mod memory;

pub use file::FileDeadLetterStore;
pub use memory::InMemoryDeadLetterStore;
