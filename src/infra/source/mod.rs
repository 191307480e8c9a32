//! Work-source backends.

pub mod memory;

pub use memory::InMemoryWorkSource;
