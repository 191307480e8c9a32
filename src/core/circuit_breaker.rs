//! Per-service circuit breakers.
//!
//! A [`CircuitBreakerRegistry`] owns one state machine per service name and is
//! shared by reference between workers. Each service's state lives behind its
//! own `parking_lot::Mutex`; every admission decision and every transition is
//! made while holding that lock, so concurrent workers cannot both win the
//! Open to HalfOpen transition.
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ---------------------------------> Open
//!     ^                                        |  now - last_failure_at >= recovery_timeout
//!     | successes >= half_open_success_threshold v
//!     +-------------------------------------- HalfOpen --(any failure)--> Open
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::GuardError;
use crate::util::{Clock, SystemClock};

/// Operational mode of one service's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; every call is attempted.
    Closed,
    /// Failing fast; calls are rejected without running.
    Open,
    /// Probing recovery with a bounded number of trial calls.
    HalfOpen,
}

/// Breaker thresholds for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a trial call.
    pub recovery_timeout: Duration,
    /// Trial successes needed to close a half-open circuit.
    pub half_open_success_threshold: u32,
    /// Trial calls allowed in flight at once while half-open.
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_success_threshold: 2,
            half_open_max_trials: 1,
        }
    }
}

impl BreakerConfig {
    /// Validate threshold values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".into());
        }
        if self.half_open_success_threshold == 0 {
            return Err("half_open_success_threshold must be greater than 0".into());
        }
        if self.half_open_max_trials == 0 {
            return Err("half_open_max_trials must be greater than 0".into());
        }
        Ok(())
    }
}

/// Observable state of one service's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCircuitState {
    /// Guarded service name.
    pub service_name: String,
    /// Current mode.
    pub state: CircuitState,
    /// Failures since the last success while closed.
    pub consecutive_failures: u32,
    /// Trial successes since the circuit went half-open.
    pub consecutive_successes: u32,
    /// Time of the most recent counted failure.
    pub last_failure_at: Option<u128>,
    /// Trial calls admitted and not yet finished.
    pub half_open_in_flight: u32,
}

impl ServiceCircuitState {
    /// Initial closed state for a service.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            half_open_in_flight: 0,
        }
    }
}

/// Breaker state plus a transition counter.
///
/// Every transition bumps `epoch`; outcomes of calls admitted under an older
/// epoch are ignored.
#[derive(Debug)]
struct CircuitCell {
    state: ServiceCircuitState,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmissionKind {
    Closed,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Admission ticket for one guarded call.
///
/// Dropping an unfinished permit (the guarded future was cancelled) returns
/// its half-open trial slot without counting an outcome.
struct Permit<'a> {
    registry: &'a CircuitBreakerRegistry,
    cell: Arc<Mutex<CircuitCell>>,
    kind: AdmissionKind,
    epoch: u64,
    finished: bool,
}

impl Permit<'_> {
    fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        self.registry.record(&self.cell, self.kind, self.epoch, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry
                .record(&self.cell, self.kind, self.epoch, Outcome::Neutral);
        }
    }
}

/// Why admission turned a call away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rejection {
    retry_after: Duration,
    trial_in_flight: bool,
}

/// Registry of independent per-service circuit breakers.
///
/// Construct one per process (or per test) and share it with `Arc`.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitCell>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Registry using `defaults` for every service and the system clock.
    #[must_use]
    pub fn new(defaults: BreakerConfig) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    /// Registry driven by an explicit clock.
    #[must_use]
    pub fn with_clock(defaults: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            circuits: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Use different thresholds for one service.
    #[must_use]
    pub fn with_service_config(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// Thresholds in effect for a service.
    #[must_use]
    pub fn config_for(&self, service: &str) -> &BreakerConfig {
        self.overrides.get(service).unwrap_or(&self.defaults)
    }

    /// Run `op` if the service's circuit admits it, counting every error as a failure.
    ///
    /// # Errors
    ///
    /// [`GuardError::CircuitOpen`] when the call was rejected (the operation
    /// was not invoked), otherwise [`GuardError::Inner`] with the operation's error.
    pub async fn guard<F, Fut, T, E>(&self, service: &str, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard_with(service, op, |_| true).await
    }

    /// Like [`guard`](Self::guard), but only errors for which
    /// `counts_as_failure` returns `true` move the breaker toward Open.
    ///
    /// Other errors are neutral: they neither reset nor add to the failure
    /// count, and a half-open trial that ends with one just frees its slot.
    ///
    /// # Errors
    ///
    /// Same as [`guard`](Self::guard).
    pub async fn guard_with<F, Fut, T, E, C>(
        &self,
        service: &str,
        op: F,
        counts_as_failure: C,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let permit = self.admit(service).map_err(|rejection| GuardError::CircuitOpen {
            service: service.to_string(),
            retry_after: rejection.retry_after,
            trial_in_flight: rejection.trial_in_flight,
        })?;

        match op().await {
            Ok(value) => {
                permit.finish(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                let outcome = if counts_as_failure(&err) {
                    Outcome::Failure
                } else {
                    Outcome::Neutral
                };
                permit.finish(outcome);
                Err(GuardError::Inner(err))
            }
        }
    }

    /// Current state of a service; a never-called service reports Closed.
    #[must_use]
    pub fn snapshot(&self, service: &str) -> ServiceCircuitState {
        self.circuits
            .read()
            .get(service)
            .map_or_else(|| ServiceCircuitState::new(service), |cell| cell.lock().state.clone())
    }

    /// States of every service seen so far, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ServiceCircuitState> {
        let circuits = self.circuits.read();
        let mut states: Vec<_> = circuits.values().map(|c| c.lock().state.clone()).collect();
        drop(circuits);
        states.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        states
    }

    /// Remaining recovery window of an open circuit, `None` if calls would be admitted.
    #[must_use]
    pub fn retry_after(&self, service: &str) -> Option<Duration> {
        let cell = self.circuits.read().get(service).cloned()?;
        let guard = cell.lock();
        if guard.state.state != CircuitState::Open {
            return None;
        }
        let remaining = self.remaining_recovery(&guard.state, self.config_for(service));
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Force a service back to Closed with zeroed counters.
    pub fn reset(&self, service: &str) {
        let cell = self.cell(service);
        let mut guard = cell.lock();
        Self::transition_to_closed(&mut guard);
        drop(guard);
        warn!(service = %service, "circuit breaker manually reset");
    }

    /// Force a service Open, starting a fresh recovery window.
    pub fn force_open(&self, service: &str) {
        let now = self.clock.now_ms();
        let cell = self.cell(service);
        let mut guard = cell.lock();
        Self::transition_to_open(&mut guard, now);
        drop(guard);
        warn!(service = %service, "circuit breaker forced open");
    }

    fn cell(&self, service: &str) -> Arc<Mutex<CircuitCell>> {
        if let Some(cell) = self.circuits.read().get(service) {
            return Arc::clone(cell);
        }
        let mut circuits = self.circuits.write();
        Arc::clone(circuits.entry(service.to_string()).or_insert_with(|| {
            debug!(service = %service, "circuit breaker created");
            Arc::new(Mutex::new(CircuitCell {
                state: ServiceCircuitState::new(service),
                epoch: 0,
            }))
        }))
    }

    fn remaining_recovery(&self, state: &ServiceCircuitState, config: &BreakerConfig) -> Duration {
        let opened_at = state.last_failure_at.unwrap_or_default();
        let elapsed = self.clock.now_ms().saturating_sub(opened_at);
        let elapsed = Duration::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX));
        config.recovery_timeout.saturating_sub(elapsed)
    }

    /// Decide admission under the service lock.
    fn admit(&self, service: &str) -> Result<Permit<'_>, Rejection> {
        let config = self.config_for(service);
        let cell = self.cell(service);
        let mut guard = cell.lock();

        let kind = match guard.state.state {
            CircuitState::Closed => AdmissionKind::Closed,
            CircuitState::Open => {
                let remaining = self.remaining_recovery(&guard.state, config);
                if !remaining.is_zero() {
                    return Err(Rejection {
                        retry_after: remaining,
                        trial_in_flight: false,
                    });
                }
                guard.state.state = CircuitState::HalfOpen;
                guard.state.consecutive_successes = 0;
                guard.state.half_open_in_flight = 1;
                guard.epoch += 1;
                info!(
                    service = %service,
                    success_threshold = config.half_open_success_threshold,
                    "circuit breaker half-open (testing recovery)"
                );
                AdmissionKind::Trial
            }
            CircuitState::HalfOpen => {
                if guard.state.half_open_in_flight >= config.half_open_max_trials {
                    return Err(Rejection {
                        retry_after: config.recovery_timeout.min(Duration::from_secs(1)),
                        trial_in_flight: true,
                    });
                }
                guard.state.half_open_in_flight += 1;
                AdmissionKind::Trial
            }
        };

        let epoch = guard.epoch;
        drop(guard);
        Ok(Permit {
            registry: self,
            cell,
            kind,
            epoch,
            finished: false,
        })
    }

    fn record(&self, cell: &Mutex<CircuitCell>, kind: AdmissionKind, epoch: u64, outcome: Outcome) {
        let now = self.clock.now_ms();
        let mut guard = cell.lock();
        if guard.epoch != epoch {
            debug!(
                service = %guard.state.service_name,
                "ignoring outcome of a call admitted before the last transition"
            );
            return;
        }
        let config = self.config_for(&guard.state.service_name).clone();

        match (kind, outcome) {
            (AdmissionKind::Closed, Outcome::Success) => {
                guard.state.consecutive_failures = 0;
            }
            (AdmissionKind::Closed, Outcome::Failure) => {
                guard.state.consecutive_failures += 1;
                guard.state.last_failure_at = Some(now);
                if guard.state.consecutive_failures >= config.failure_threshold {
                    Self::transition_to_open(&mut guard, now);
                    error!(
                        service = %guard.state.service_name,
                        consecutive_failures = guard.state.consecutive_failures,
                        failure_threshold = config.failure_threshold,
                        recovery_timeout_secs = config.recovery_timeout.as_secs(),
                        "circuit breaker opened (failing fast)"
                    );
                }
            }
            (AdmissionKind::Closed, Outcome::Neutral) => {}
            (AdmissionKind::Trial, Outcome::Success) => {
                guard.state.half_open_in_flight = guard.state.half_open_in_flight.saturating_sub(1);
                guard.state.consecutive_successes += 1;
                if guard.state.consecutive_successes >= config.half_open_success_threshold {
                    Self::transition_to_closed(&mut guard);
                    info!(service = %guard.state.service_name, "circuit breaker closed (recovered)");
                }
            }
            (AdmissionKind::Trial, Outcome::Failure) => {
                Self::transition_to_open(&mut guard, now);
                error!(
                    service = %guard.state.service_name,
                    "half-open trial failed; circuit breaker reopened"
                );
            }
            (AdmissionKind::Trial, Outcome::Neutral) => {
                guard.state.half_open_in_flight = guard.state.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    fn transition_to_open(cell: &mut CircuitCell, now: u128) {
        cell.state.state = CircuitState::Open;
        cell.state.last_failure_at = Some(now);
        cell.state.consecutive_successes = 0;
        cell.state.half_open_in_flight = 0;
        cell.epoch += 1;
    }

    fn transition_to_closed(cell: &mut CircuitCell) {
        cell.state.state = CircuitState::Closed;
        cell.state.consecutive_failures = 0;
        cell.state.consecutive_successes = 0;
        cell.state.half_open_in_flight = 0;
        cell.state.last_failure_at = None;
        cell.epoch += 1;
    }
}
