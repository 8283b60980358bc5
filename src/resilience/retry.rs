//! Retry with exponential backoff, symmetric jitter and retry-after overrides.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{Rng, thread_rng};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Retryable, circuit_breaker::CircuitBreaker};
use crate::config::RetryConfig;

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Non-retryable failure, surfaced after the first attempt
    #[error("permanent failure: {0}")]
    Permanent(#[source] E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The upstream error, when one was observed.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Permanent(err) => Some(err),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled | RetryError::CircuitOpen => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent(err) => Some(err),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled | RetryError::CircuitOpen => None,
        }
    }
}

/// Executes fallible async operations under a [`RetryConfig`] policy.
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether an error qualifies for another attempt.
    pub fn is_retryable<E: Retryable>(&self, err: &E) -> bool {
        match err.status() {
            Some(status) => self.config.retryable_statuses.contains(&status),
            None => err.is_network(),
        }
    }

    /// Backoff before retry number `attempt` (0-based), jittered with the thread RNG.
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_with_rng(&self.config, attempt, &mut thread_rng())
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts its attempts,
    /// or `cancel` fires. An attempt already in flight is never aborted; only
    /// the wait between attempts observes cancellation.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        breaker: Option<&CircuitBreaker>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            if let Some(breaker) = breaker {
                if !breaker.allow() {
                    counter!("resilience_circuit_rejections_total").increment(1);
                    return Err(RetryError::CircuitOpen);
                }
            }
            let mut trial = TrialGuard { breaker };

            let err = match op().await {
                Ok(value) => {
                    trial.success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            // The upstream answered; a rejected request says nothing about its health.
            if !self.is_retryable(&err) {
                trial.success();
                return Err(RetryError::Permanent(err));
            }
            trial.failure();

            attempt += 1;
            if attempt >= max_attempts {
                counter!("resilience_retries_exhausted_total").increment(1);
                warn!(attempts = attempt, error = %err, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.backoff(attempt - 1));
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            counter!("resilience_retries_total").increment(1);

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Holds a breaker admission for one attempt. Dropping it without an outcome
/// (the attempt future was cancelled) hands the half-open trial slot back.
struct TrialGuard<'a> {
    breaker: Option<&'a CircuitBreaker>,
}

impl TrialGuard<'_> {
    fn success(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.record_success();
        }
    }

    fn failure(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.record_failure();
        }
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.release_trial();
        }
    }
}

/// `initial × factor^attempt`, perturbed by `± jitter × backoff`, capped at max.
pub fn backoff_with_rng<R: Rng + ?Sized>(
    config: &RetryConfig,
    attempt: u32,
    rng: &mut R,
) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = config.initial_backoff_ms as f64 * config.backoff_factor.powi(exponent);
    let jittered = if config.jitter_factor > 0.0 {
        raw * (1.0 + rng.gen_range(-config.jitter_factor..=config.jitter_factor))
    } else {
        raw
    };
    let capped = jittered.min(config.max_backoff_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Parses a `Retry-After` header value given as whole seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::resilience::CircuitState;
    use rand::{SeedableRng, rngs::StdRng};
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    #[derive(Debug, Error)]
    #[error("test failure status={status:?}")]
    struct TestError {
        status: Option<u16>,
        network: bool,
        retry_after: Option<Duration>,
    }

    impl TestError {
        fn status(code: u16) -> Self {
            Self {
                status: Some(code),
                network: false,
                retry_after: None,
            }
        }

        fn network() -> Self {
            Self {
                status: None,
                network: true,
                retry_after: None,
            }
        }
    }

    impl Retryable for TestError {
        fn status(&self) -> Option<u16> {
            self.status
        }

        fn is_network(&self) -> bool {
            self.network
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn backoff_stays_within_jitter_bounds_and_cap() {
        let config = RetryConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            ..RetryConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..10u32 {
            for _ in 0..50 {
                let raw = 1000.0 * 2f64.powi(attempt as i32);
                let delay = backoff_with_rng(&config, attempt, &mut rng).as_millis() as f64;
                let low = (raw * 0.9).min(60_000.0).floor();
                let high = (raw * 1.1).min(60_000.0);
                assert!(
                    delay >= low - 1.0 && delay <= high,
                    "attempt {attempt}: {delay} outside [{low}, {high}]"
                );
            }
        }
    }

    #[test]
    fn parse_retry_after_accepts_seconds_and_http_dates() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        let future = (Utc::now() + chrono::Duration::seconds(120)).to_rfc2822();
        let parsed = parse_retry_after(&future).expect("future date parses");
        assert!(parsed > Duration::from_secs(100));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test]
    async fn retries_transient_statuses_until_success() {
        let retrier = Retrier::new(fast_config(3));
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = retrier
            .execute(&cancel, None, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::status(503))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_status_is_not_retried() {
        let retrier = Retrier::new(fast_config(3));
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retrier
            .execute(&cancel, None, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::status(404))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_errors_exhaust_the_budget() {
        let retrier = Retrier::new(fast_config(2));
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retrier
            .execute(&cancel, None, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::network())
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_computed_backoff() {
        let retrier = Retrier::new(fast_config(1));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = retrier
            .execute(&cancel, None, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TestError {
                            status: Some(429),
                            network: false,
                            retry_after: Some(Duration::from_secs(7)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_the_loop() {
        let retrier = Retrier::new(RetryConfig {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = retrier
            .execute(&cancel, None, || async { Err(TestError::status(500)) })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_calling() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_seconds: 60,
            half_open_max: 1,
        });
        breaker.record_failure();

        let retrier = Retrier::new(fast_config(3));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), RetryError<TestError>> = retrier
            .execute(&cancel, Some(&breaker), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn half_open_breaker() -> CircuitBreaker {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_seconds: 30,
            half_open_max: 1,
        });
        breaker.record_failure();
        breaker
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_during_half_open_trial_does_not_wedge_breaker() {
        let breaker = half_open_breaker();
        tokio::time::advance(Duration::from_secs(31)).await;

        let retrier = Retrier::new(fast_config(2));
        let cancel = CancellationToken::new();
        let trial: Result<(), _> = retrier
            .execute(&cancel, Some(&breaker), || async { Err(TestError::status(404)) })
            .await;
        assert!(matches!(trial, Err(RetryError::Permanent(_))));
        assert_ne!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let healthy: Result<(), RetryError<TestError>> = retrier
            .execute(&cancel, Some(&breaker), || async { Ok(()) })
            .await;
        assert!(healthy.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_attempt_returns_its_slot() {
        let breaker = half_open_breaker();
        tokio::time::advance(Duration::from_secs(31)).await;

        let retrier = Retrier::new(fast_config(2));
        let cancel = CancellationToken::new();
        let stalled = tokio::time::timeout(
            Duration::from_secs(5),
            retrier.execute(&cancel, Some(&breaker), || async {
                std::future::pending::<Result<(), TestError>>().await
            }),
        )
        .await;
        assert!(stalled.is_err(), "attempt never completes");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let next: Result<(), RetryError<TestError>> = retrier
            .execute(&cancel, Some(&breaker), || async { Ok(()) })
            .await;
        assert!(next.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
