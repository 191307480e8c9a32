//! Dispatch core configuration structures.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{
    AppResult, BreakerConfig, DispatchLimits, Jitter, RetryPolicy, SchedulerConfig, WorkerPoolConfig,
};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before a trial call.
    pub recovery_timeout_secs: u64,
    /// Trial successes that close a half-open circuit.
    pub half_open_success_threshold: u32,
    /// Concurrent trial calls while half-open.
    pub half_open_max_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_secs: config.recovery_timeout.as_secs(),
            half_open_success_threshold: config.half_open_success_threshold,
            half_open_max_trials: config.half_open_max_trials,
        }
    }
}

impl BreakerSettings {
    /// Typed breaker configuration.
    #[must_use]
    pub const fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            half_open_success_threshold: self.half_open_success_threshold,
            half_open_max_trials: self.half_open_max_trials,
        }
    }
}

/// Defaults for every service plus per-service overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    /// Thresholds applied to services without an override.
    #[serde(flatten)]
    pub defaults: BreakerSettings,
    /// Overrides keyed by service name, e.g. `sms-provider`.
    pub services: HashMap<String, BreakerSettings>,
}

/// Retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure, milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on any delay, milliseconds.
    pub backoff_cap_ms: u64,
    /// Apply equal jitter to backoff delays.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            jitter: true,
        }
    }
}

/// Sweep and retention timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between due-item sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds between ledger retention passes.
    pub retention_interval_secs: u64,
    /// Days completion records are kept.
    pub ledger_retention_days: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            retention_interval_secs: DAY_SECS,
            ledger_retention_days: 90,
        }
    }
}

/// Worker pool sizing and per-task limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Concurrent workers; `0` means one per CPU.
    pub worker_count: usize,
    /// Consume poll interval, milliseconds.
    pub poll_interval_ms: u64,
    /// Seconds before a running send is logged as slow.
    pub task_soft_limit_secs: u64,
    /// Seconds before a running send is abandoned.
    pub task_hard_limit_secs: u64,
    /// Seconds before an uncommitted ledger claim can be taken over.
    pub claim_lease_secs: u64,
    /// Seconds a delivery stays invisible before redelivery.
    pub visibility_timeout_secs: u64,
    /// Seconds each worker gets to finish on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Maximum unacknowledged envelopes in the in-memory queue.
    pub max_queue_depth: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 1_000,
            task_soft_limit_secs: 300,
            task_hard_limit_secs: 360,
            claim_lease_secs: 600,
            visibility_timeout_secs: 420,
            shutdown_timeout_secs: 2,
            max_queue_depth: 10_000,
        }
    }
}

/// Root dispatch configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Circuit breaker thresholds.
    pub breaker: BreakerSection,
    /// Retry policy.
    pub retry: RetrySettings,
    /// Scheduler timing.
    pub scheduler: SchedulerSettings,
    /// Worker pool and task limits.
    pub worker: WorkerSettings,
}

fn validate_breaker(settings: &BreakerSettings) -> Result<(), String> {
    settings.to_breaker_config().validate()?;
    if settings.recovery_timeout_secs == 0 {
        return Err("recovery_timeout_secs must be greater than 0".into());
    }
    Ok(())
}

impl CoreConfig {
    /// Validate every section and the relations between time limits.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        validate_breaker(&self.breaker.defaults).map_err(|e| format!("breaker invalid: {e}"))?;
        for (name, settings) in &self.breaker.services {
            validate_breaker(settings).map_err(|e| format!("breaker `{name}` invalid: {e}"))?;
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        if retry.backoff_base_ms == 0 {
            return Err("backoff_base_ms must be greater than 0".into());
        }
        if retry.backoff_base_ms > retry.backoff_cap_ms {
            return Err("backoff_base_ms must not exceed backoff_cap_ms".into());
        }

        let scheduler = &self.scheduler;
        if scheduler.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than 0".into());
        }
        if scheduler.retention_interval_secs == 0 {
            return Err("retention_interval_secs must be greater than 0".into());
        }
        if scheduler.ledger_retention_days == 0 {
            return Err("ledger_retention_days must be greater than 0".into());
        }

        let worker = &self.worker;
        if worker.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if worker.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if worker.task_hard_limit_secs <= worker.task_soft_limit_secs {
            return Err("task_hard_limit_secs must exceed task_soft_limit_secs".into());
        }
        if worker.claim_lease_secs < worker.task_hard_limit_secs {
            return Err("claim_lease_secs must be at least task_hard_limit_secs".into());
        }
        if worker.visibility_timeout_secs <= worker.task_hard_limit_secs {
            return Err("visibility_timeout_secs must exceed task_hard_limit_secs".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, starts from `DISPATCH_CONFIG_FILE` (JSON) or
    /// the defaults, then applies `DISPATCH_*` variable overrides.
    ///
    /// # Errors
    ///
    /// Fails on an unreadable config file, an unparsable override, or invalid values.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var("DISPATCH_CONFIG_FILE") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Read and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json_str(&input)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("loading config file {}", path.display()))
    }

    /// Apply `DISPATCH_*` overrides using `lookup` to read variables.
    ///
    /// # Errors
    ///
    /// Fails when a variable is present but does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> AppResult<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{name}={raw:?}: {e}"))
        }

        macro_rules! override_field {
            ($name:literal, $field:expr) => {
                if let Some(raw) = lookup($name) {
                    $field = parse($name, &raw)?;
                }
            };
        }

        override_field!("DISPATCH_FAILURE_THRESHOLD", self.breaker.defaults.failure_threshold);
        override_field!("DISPATCH_RECOVERY_TIMEOUT_SECS", self.breaker.defaults.recovery_timeout_secs);
        override_field!(
            "DISPATCH_HALF_OPEN_SUCCESS_THRESHOLD",
            self.breaker.defaults.half_open_success_threshold
        );
        override_field!("DISPATCH_HALF_OPEN_MAX_TRIALS", self.breaker.defaults.half_open_max_trials);
        override_field!("DISPATCH_MAX_ATTEMPTS", self.retry.max_attempts);
        override_field!("DISPATCH_BACKOFF_BASE_MS", self.retry.backoff_base_ms);
        override_field!("DISPATCH_BACKOFF_CAP_MS", self.retry.backoff_cap_ms);
        override_field!("DISPATCH_JITTER", self.retry.jitter);
        override_field!("DISPATCH_SWEEP_INTERVAL_SECS", self.scheduler.sweep_interval_secs);
        override_field!("DISPATCH_RETENTION_INTERVAL_SECS", self.scheduler.retention_interval_secs);
        override_field!("DISPATCH_LEDGER_RETENTION_DAYS", self.scheduler.ledger_retention_days);
        override_field!("DISPATCH_WORKER_COUNT", self.worker.worker_count);
        override_field!("DISPATCH_POLL_INTERVAL_MS", self.worker.poll_interval_ms);
        override_field!("DISPATCH_TASK_SOFT_LIMIT_SECS", self.worker.task_soft_limit_secs);
        override_field!("DISPATCH_TASK_HARD_LIMIT_SECS", self.worker.task_hard_limit_secs);
        override_field!("DISPATCH_CLAIM_LEASE_SECS", self.worker.claim_lease_secs);
        override_field!("DISPATCH_VISIBILITY_TIMEOUT_SECS", self.worker.visibility_timeout_secs);
        override_field!("DISPATCH_MAX_QUEUE_DEPTH", self.worker.max_queue_depth);
        Ok(())
    }

    /// Retry policy described by the `retry` section.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff_base: Duration::from_millis(self.retry.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.retry.backoff_cap_ms),
            jitter: if self.retry.jitter { Jitter::Equal } else { Jitter::None },
        }
    }

    /// Scheduler timing described by the `scheduler` section.
    #[must_use]
    pub const fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sweep_interval: Duration::from_secs(self.scheduler.sweep_interval_secs),
            retention_interval: Duration::from_secs(self.scheduler.retention_interval_secs),
            ledger_retention: Duration::from_secs(self.scheduler.ledger_retention_days * DAY_SECS),
            max_attempts: self.retry.max_attempts,
        }
    }

    /// Worker pool configuration; a zero worker count resolves to the CPU count.
    #[must_use]
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(self.worker.shutdown_timeout_secs),
            ..WorkerPoolConfig::default()
        }
        .with_worker_count(self.worker.worker_count)
    }

    /// Soft/hard limits for the dispatcher.
    #[must_use]
    pub const fn dispatch_limits(&self) -> DispatchLimits {
        DispatchLimits {
            soft_limit: Duration::from_secs(self.worker.task_soft_limit_secs),
            hard_limit: Duration::from_secs(self.worker.task_hard_limit_secs),
            ledger_retry_delay: Duration::from_secs(5),
        }
    }

    /// Claim lease for ledger backends.
    #[must_use]
    pub const fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.worker.claim_lease_secs)
    }

    /// Visibility timeout for the in-memory queue.
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.visibility_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = CoreConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.breaker.defaults.failure_threshold, 5);
        assert_eq!(cfg.retry_policy().max_attempts, 4);
        assert_eq!(cfg.scheduler_config().ledger_retention, Duration::from_secs(90 * DAY_SECS));
    }

    #[test]
    fn test_hard_limit_must_exceed_soft() {
        let mut cfg = CoreConfig::default();
        cfg.worker.task_hard_limit_secs = 300;
        assert!(cfg.validate().unwrap_err().contains("task_hard_limit_secs"));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = CoreConfig::default();
        cfg.apply_env_overrides(|name| match name {
            "DISPATCH_FAILURE_THRESHOLD" => Some("3".into()),
            "DISPATCH_JITTER" => Some("false".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.breaker.defaults.failure_threshold, 3);
        assert_eq!(cfg.retry_policy().jitter, Jitter::None);
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut cfg = CoreConfig::default();
        let err = cfg
            .apply_env_overrides(|name| (name == "DISPATCH_MAX_ATTEMPTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("DISPATCH_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_zero_workers_means_cpu_count() {
        let mut cfg = CoreConfig::default();
        cfg.worker.worker_count = 0;
        assert_eq!(cfg.worker_pool_config().worker_count, num_cpus::get());
    }
}
