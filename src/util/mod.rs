//! Shared utilities: time sources, idempotency key derivation, and telemetry setup.

pub mod clock;
pub mod keys;
pub mod telemetry;

pub use clock::*;
pub use keys::*;
pub use telemetry::*;
