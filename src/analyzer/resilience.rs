/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Circuit breaker and retry policy around outbound sends.
//!
//! # State machine
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[reset_timeout elapsed]--> HalfOpen (one trial permitted)
//! HalfOpen --[trial succeeds]--> Closed
//! HalfOpen --[trial fails]--> Open (timer restarts)
//! ```
//!
//! While the breaker is open every send is rejected with
//! [`Error::CircuitOpen`] before any I/O. Retries compose with the breaker:
//! each attempt re-asks the breaker for permission, so a breaker that trips
//! mid-retry cuts the retry loop short.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::error::{Error, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Sends flow normally.
    Closed,
    /// Sends are rejected without I/O.
    Open,
    /// One trial send is allowed to probe recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Current state, with the open-to-half-open timer applied lazily.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask permission for one send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] while the breaker is open, and while a
    /// half-open trial is already in flight.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if cooled_down {
                    info!("circuit half-open: allowing one trial send");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Error::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful send.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit closed after successful send");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed send.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("half-open trial failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        "circuit opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Exponential backoff retry policy.
///
/// The delay for attempt `n` (0-indexed) is `base × 2^n`, clamped to `max`.
/// Deriving each delay from the attempt number alone keeps the sequence
/// monotonically non-decreasing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build from configuration, enforcing at least one attempt.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Total attempts per logical request.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait before retrying after attempt `attempt` failed.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Breaker and retry composed around an operation.
#[derive(Debug)]
pub struct ResilienceLayer {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResilienceLayer {
    /// Build from configuration.
    #[must_use]
    pub fn new(breaker: &BreakerConfig, retry: &RetryConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker),
            retry: RetryPolicy::new(retry),
        }
    }

    /// Breaker state, for observability.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `operation` under the breaker, retrying transient failures.
    ///
    /// `operation` receives the attempt number (0-indexed). Non-retryable
    /// failures and exhausted budgets return the last error unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] without running the operation while the breaker
    /// is open; otherwise whatever the final attempt returned.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            self.breaker.try_acquire()?;

            match operation(attempt).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) => {
                    // Cancellation is not a send failure; it must not trip
                    // the breaker or burn retry budget.
                    if matches!(error, Error::Cancelled(_)) {
                        return Err(error);
                    }
                    self.breaker.record_failure();

                    let out_of_budget = attempt + 1 >= self.retry.max_attempts();
                    if !error.is_retryable() || out_of_budget {
                        return Err(error);
                    }

                    let delay = self.retry.backoff(attempt);
                    debug!(
                        "attempt {} failed ({error}); retrying in {delay:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
        })
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 8,
        }
    }

    #[test]
    fn test_breaker_starts_closed() {
        let cb = breaker(3, 1_000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(), Err(Error::CircuitOpen));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let cb = breaker(1, 0);
        cb.record_failure();
        // reset_timeout of zero: immediately eligible for a trial.
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second concurrent acquire is rejected while the trial is in flight.
        assert_eq!(cb.try_acquire(), Err(Error::CircuitOpen));
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.try_acquire().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 60_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Force the cooldown by rebuilding with a zero reset timeout.
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 50,
        });
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(3), Duration::from_millis(50));
        assert_eq!(policy.backoff(30), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_execute_retries_transient_failures() {
        let layer = ResilienceLayer::new(&BreakerConfig::default(), &fast_retry(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result = layer
            .execute(move |_attempt| {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Communication("flaky pipe".to_string()))
                    } else {
                        Ok(7u32)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_does_not_retry_cancellation() {
        let layer = ResilienceLayer::new(&BreakerConfig::default(), &fast_retry(5));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: Result<u32> = layer
            .execute(move |_attempt| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Cancelled("stop".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Cancellation did not count as a send failure.
        assert_eq!(layer.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_exhausts_budget_then_returns_last_error() {
        let layer = ResilienceLayer::new(&BreakerConfig::default(), &fast_retry(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: Result<u32> = layer
            .execute(move |_attempt| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Communication("still broken".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Communication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_running_operation() {
        let layer = ResilienceLayer::new(
            &BreakerConfig {
                failure_threshold: 2,
                reset_timeout_ms: 60_000,
            },
            &fast_retry(1),
        );

        for _ in 0..2 {
            let _: Result<u32> = layer
                .execute(|_| async { Err(Error::Communication("down".to_string())) })
                .await;
        }
        assert_eq!(layer.circuit_state(), CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<u32> = layer
            .execute(move |_attempt| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert_eq!(result, Err(Error::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_trip_mid_retry_cuts_loop_short() {
        // Threshold 2, budget 5: the third acquire hits an open breaker.
        let layer = ResilienceLayer::new(
            &BreakerConfig {
                failure_threshold: 2,
                reset_timeout_ms: 60_000,
            },
            &fast_retry(5),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: Result<u32> = layer
            .execute(move |_attempt| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Communication("down".to_string()))
                }
            })
            .await;

        assert_eq!(result, Err(Error::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(layer.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_recovery_trial_after_reset_timeout() {
        let layer = ResilienceLayer::new(
            &BreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 20,
            },
            &fast_retry(1),
        );

        let _: Result<u32> = layer
            .execute(|_| async { Err(Error::Communication("down".to_string())) })
            .await;
        assert_eq!(layer.circuit_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let result: Result<u32> = layer.execute(|_| async { Ok(9) }).await;
        assert_eq!(result, Ok(9));
        assert_eq!(layer.circuit_state(), CircuitState::Closed);
    }
}
