//! Runtime surface: the running service and its health report.

pub mod service;

pub use service::{DispatchService, HealthReport};
