//! Configuration models for breakers, retries, scheduling and workers.

pub mod dispatch;

pub use dispatch::{BreakerSection, BreakerSettings, CoreConfig, RetrySettings, SchedulerSettings, WorkerSettings};
