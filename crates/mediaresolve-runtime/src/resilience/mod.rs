//! Resilience patterns for mediaresolve-runtime.
//!
//! This module provides:
//! - Per-source circuit breakers to isolate failing sources
//! - Exponential backoff with jitter for background retries

mod backoff;
mod circuit_breaker;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
