//! Resilience primitives wrapped around every marketplace call.
//!
//! [`Retrier`] retries transient failures with exponential backoff and jitter;
//! [`CircuitBreaker`] stops calling a dependency that keeps failing.

pub mod circuit_breaker;
pub mod retry;

use std::time::Duration;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use retry::{RetryError, Retrier, parse_retry_after};

/// Classification hooks the [`Retrier`] uses to decide whether to try again.
pub trait Retryable {
    /// HTTP status returned by the upstream, if the failure carried one.
    fn status(&self) -> Option<u16>;

    /// True when the call failed before any status was received.
    fn is_network(&self) -> bool;

    /// Server-supplied delay that overrides computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}
