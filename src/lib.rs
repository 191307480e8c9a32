//! # Prometheus Dispatch
//!
//! A resilient reminder dispatch core: periodic sweeps turn due work items into
//! queued tasks, and a pool of workers delivers them through external channel
//! providers (email, SMS, chat) over an at-least-once queue.
//!
//! ## Core Problem Solved
//!
//! At-least-once delivery means every task may run more than once, and the
//! providers behind it fail in bursts:
//!
//! - **Duplicate sends**: redelivered tasks and overlapping sweeps must not notify twice
//! - **Provider outages**: a failing provider must fail fast instead of tying up workers
//! - **Poison tasks**: bad input must not be retried forever
//!
//! ## Key Features
//!
//! - **Circuit Breaker Registry**: independent Closed/Open/HalfOpen state per provider
//! - **Idempotency Ledger**: atomic claim, commit on success, release on failure
//! - **Retry Policy**: capped exponential backoff with jitter and a dead-letter store
//! - **Worker Pool**: tokio workers with soft/hard time limits and graceful shutdown
//! - **Reminder Scheduler**: periodic sweep plus ledger retention pruning
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_dispatch::builders::CoreBuilder;
//! use prometheus_dispatch::config::CoreConfig;
//! use prometheus_dispatch::infra::{InMemoryWorkSource, LoggingChannel};
//! use prometheus_dispatch::runtime::DispatchService;
//!
//! prometheus_dispatch::util::init_tracing();
//! let core = CoreBuilder::new(CoreConfig::from_env()?)
//!     .source(Arc::new(InMemoryWorkSource::new()))
//!     .channel(Arc::new(LoggingChannel::new("email")))
//!     .build()?;
//! let service = DispatchService::start(core)?;
//! // ...
//! service.shutdown().await;
//! ```
//!
//! For complete examples, see:
//! - `tests/dispatcher_test.rs` - retry, dead-letter and duplicate handling
//! - `tests/runtime_test.rs` - the assembled service end to end

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core dispatch abstractions: breakers, ledger, retry, queue contract, dispatcher, scheduler.
pub mod core;
/// Configuration models for breakers, retries, scheduling and workers.
pub mod config;
/// Builders to construct dispatch components from configuration.
pub mod builders;
/// Infrastructure adapters for queues, ledgers, work sources, dead letters and channels.
pub mod infra;
/// Running service and health reporting.
pub mod runtime;
/// Shared utilities.
pub mod util;
