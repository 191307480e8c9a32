//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "prometheus_dispatch=info";

/// Install the default env-based subscriber unless the host already set one.
///
/// Filtering follows `RUST_LOG`, e.g. `RUST_LOG=prometheus_dispatch=debug`,
/// falling back to [`DEFAULT_LOG_FILTER`]. Called by
/// [`DispatchService::start`](crate::runtime::DispatchService::start).
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
