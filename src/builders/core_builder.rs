//! Assemble the dispatch core from configuration and injected backends.

use std::fmt;
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::core::{
    AuditSink, ChannelProvider, ChannelRouter, CircuitBreakerRegistry, CoreError, DeadLetterStore,
    IdempotencyLedger, NotificationDispatcher, ReminderScheduler, TaskQueueClient, WorkSource,
};
use crate::infra::{InMemoryDeadLetterStore, InMemoryLedger, InMemoryTaskQueue};
use crate::util::{Clock, SystemClock};

/// Build a breaker registry with the configured defaults and per-service overrides.
#[must_use]
pub fn build_breaker_registry(config: &CoreConfig, clock: Arc<dyn Clock>) -> CircuitBreakerRegistry {
    config.breaker.services.iter().fold(
        CircuitBreakerRegistry::with_clock(config.breaker.defaults.to_breaker_config(), clock),
        |registry, (service, settings)| registry.with_service_config(service.clone(), settings.to_breaker_config()),
    )
}

/// Wired components sharing one registry, queue and ledger.
#[derive(Clone)]
pub struct DispatchCore {
    /// Validated configuration.
    pub config: CoreConfig,
    /// Breakers shared by every worker.
    pub registry: Arc<CircuitBreakerRegistry>,
    /// Task queue.
    pub queue: Arc<dyn TaskQueueClient>,
    /// Idempotency ledger.
    pub ledger: Arc<dyn IdempotencyLedger>,
    /// Dead-letter store.
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// Worker-side processor.
    pub dispatcher: Arc<NotificationDispatcher>,
    /// Due-item sweeper.
    pub scheduler: Arc<ReminderScheduler>,
}

impl fmt::Debug for DispatchCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCore")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DispatchCore`].
///
/// Queue, ledger and dead-letter store default to the in-memory backends; a
/// work source and at least one channel provider are required.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use prometheus_dispatch::builders::CoreBuilder;
/// use prometheus_dispatch::config::CoreConfig;
/// use prometheus_dispatch::infra::{InMemoryWorkSource, LoggingChannel};
///
/// let core = CoreBuilder::new(CoreConfig::from_env()?)
///     .source(Arc::new(InMemoryWorkSource::new()))
///     .channel(Arc::new(LoggingChannel::new("email")))
///     .build()?;
/// ```
pub struct CoreBuilder {
    config: CoreConfig,
    queue: Option<Arc<dyn TaskQueueClient>>,
    ledger: Option<Arc<dyn IdempotencyLedger>>,
    source: Option<Arc<dyn WorkSource>>,
    channels: ChannelRouter,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreBuilder")
            .field("config", &self.config)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl CoreBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            queue: None,
            ledger: None,
            source: None,
            channels: ChannelRouter::new(),
            dead_letters: None,
            audit: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific task queue.
    #[must_use]
    pub fn queue(mut self, queue: Arc<dyn TaskQueueClient>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use a specific idempotency ledger.
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Work source the scheduler sweeps.
    #[must_use]
    pub fn source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Register a channel provider.
    #[must_use]
    pub fn channel(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.channels.register(provider);
        self
    }

    /// Use a specific dead-letter store.
    #[must_use]
    pub fn dead_letters(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Attach an audit sink to the dispatcher and scheduler.
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Drive every component from one clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and wire the components.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] for invalid configuration, a missing work
    /// source, or no channel providers.
    pub fn build(self) -> Result<DispatchCore, CoreError> {
        let Self {
            config,
            queue,
            ledger,
            source,
            channels,
            dead_letters,
            audit,
            clock,
        } = self;

        config
            .validate()
            .map_err(|e| CoreError::InvalidConfig(format!("config invalid: {e}")))?;
        let source = source.ok_or_else(|| CoreError::InvalidConfig("work source is required".into()))?;
        if channels.channels().is_empty() {
            return Err(CoreError::InvalidConfig("no channel providers registered".into()));
        }

        let registry = Arc::new(build_breaker_registry(&config, Arc::clone(&clock)));
        let queue = queue.unwrap_or_else(|| {
            Arc::new(
                InMemoryTaskQueue::new(config.worker.max_queue_depth)
                    .with_visibility_timeout(config.visibility_timeout())
                    .with_clock(Arc::clone(&clock)),
            )
        });
        let ledger = ledger.unwrap_or_else(|| {
            Arc::new(InMemoryLedger::with_clock(Arc::clone(&clock)).with_claim_lease(config.claim_lease()))
        });
        let dead_letters: Arc<dyn DeadLetterStore> =
            dead_letters.unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));

        let mut dispatcher = NotificationDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            config.retry_policy(),
            channels,
            Arc::clone(&dead_letters),
        )
        .with_clock(Arc::clone(&clock))
        .with_limits(config.dispatch_limits());

        let mut scheduler = ReminderScheduler::new(
            source,
            Arc::clone(&queue),
            Arc::clone(&ledger),
            config.scheduler_config(),
        )
        .with_clock(clock);

        if let Some(audit) = audit {
            dispatcher = dispatcher.with_audit(Arc::clone(&audit));
            scheduler = scheduler.with_audit(audit);
        }

        Ok(DispatchCore {
            config,
            registry,
            queue,
            ledger,
            dead_letters,
            dispatcher: Arc::new(dispatcher),
            scheduler: Arc::new(scheduler),
        })
    }
}
