//! Builders to construct dispatch components from configuration.

pub mod core_builder;

pub use core_builder::{build_breaker_registry, CoreBuilder, DispatchCore};
