//! Channel provider adapters.

pub mod log;

pub use log::LoggingChannel;
