//! Resilience primitives protecting calls to downstream services.
//!
//! - [`RetryPolicy`]: exponential backoff with optional jitter
//! - [`CircuitBreaker`]: fail-fast gate per target

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use retry::RetryPolicy;
