//! Three-state circuit breaker and a per-connection registry of breakers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Circuit breaker guarding a single upstream dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Whether a call may proceed. Moves an expired open breaker to half-open
    /// and counts half-open trial admissions.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout())
                    .unwrap_or(true);
                if !expired {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_admitted = 1;
                inner.half_open_successes = 0;
                info!("circuit breaker half-open");
                true
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.opened_at = None;
                    inner.half_open_admitted = 0;
                    inner.half_open_successes = 0;
                    info!("circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Returns an unused half-open trial slot, for calls that ended without
    /// an outcome (cancelled or dropped mid-flight).
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_admitted > inner.half_open_successes {
            inner.half_open_admitted -= 1;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    counter!("resilience_circuit_opened_total").increment(1);
                    warn!(failures = inner.failures, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                inner.failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
                counter!("resilience_circuit_opened_total").increment(1);
                warn!("half-open trial failed, circuit breaker reopened");
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

/// One breaker per marketplace connection, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<Uuid, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_connection(&self, connection_id: Uuid) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(connection_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub fn states(&self) -> HashMap<Uuid, CircuitState> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.iter().map(|(id, b)| (*id, b.state())).collect()
    }
}
