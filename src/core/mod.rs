//! Core dispatch abstractions: breakers, ledger, retry policy, queue contract, dispatcher, scheduler.

pub mod audit;
pub mod channel;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod worker_pool;

pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use channel::{ChannelProvider, ChannelRouter, SendSummary};
pub use circuit_breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitState, ServiceCircuitState};
pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use dispatcher::{DispatchLimits, DispatchOutcome, DispatchStats, NotificationDispatcher};
pub use envelope::{AttemptRecord, NotificationPayload, TaskEnvelope, WorkItem};
pub use error::{AppResult, ChannelError, CoreError, FailureKind, GuardError};
pub use ledger::{IdempotencyLedger, IdempotencyRecord};
pub use queue::{Delivery, Receipt, TaskQueueClient};
pub use retry::{Jitter, RetryDecision, RetryPolicy};
pub use scheduler::{ReminderScheduler, SchedulerConfig, SweepReport};
pub use source::WorkSource;
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig};
