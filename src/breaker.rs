/// Circuit breaker for calls into unreliable dependencies
///
/// Closed -> Open after `failure_threshold` consecutive failures.
/// Open -> HalfOpen on the first call after `recovery_timeout`.
/// HalfOpen -> Closed after `success_threshold` consecutive successes,
/// HalfOpen -> Open on any failure.
///
/// Bookkeeping sits behind a short-lived mutex; the wrapped future always
/// runs outside it. While half-open only one probe call is admitted at a time.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Cumulative counters; only `reset()` moves them backwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub stats: BreakerStats,
    pub config: BreakerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open, retry after {}ms", .retry_after.as_millis())]
    Open { name: String, retry_after: Duration },

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn map_inner<F>(self, f: impl FnOnce(E) -> F) -> BreakerError<F> {
        match self {
            BreakerError::Open { name, retry_after } => BreakerError::Open { name, retry_after },
            BreakerError::Inner(e) => BreakerError::Inner(f(e)),
        }
    }
}

struct Inner {
    state: CircuitState,
    stats: BreakerStats,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                stats: BreakerStats::default(),
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recovery_timeout_ms)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // no update panics halfway, so state behind a poisoned lock is intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        self.lock().stats.clone()
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            name: self.config.name.clone(),
            state: inner.state,
            stats: inner.stats.clone(),
            config: self.config.clone(),
        }
    }

    /// Back to Closed with zeroed stats.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.stats = BreakerStats::default();
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        tracing::info!(breaker = %self.config.name, "Circuit breaker reset");
    }

    /// Run `op` through the breaker; every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(op, |_| true).await
    }

    /// Run `op` through the breaker; only errors for which `is_failure`
    /// returns true affect the state. Other errors pass through untouched.
    pub async fn call_classified<T, E, F, Fut>(
        &self,
        op: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = self.admit::<E>()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(probe),
            Err(e) if is_failure(e) => self.on_failure(probe),
            Err(_) => self.on_neutral(probe),
        }
        result.map_err(BreakerError::Inner)
    }

    /// Decide whether a call may proceed. Returns whether it is the half-open probe.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.lock();
        let timeout = self.recovery_timeout();

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(timeout);
                if elapsed >= timeout && !inner.probe_in_flight {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(
                        breaker = %self.config.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Circuit breaker half-open, admitting probe"
                    );
                    Ok(true)
                } else {
                    inner.stats.rejected_count += 1;
                    Err(BreakerError::Open {
                        name: self.config.name.clone(),
                        retry_after: timeout.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.stats.rejected_count += 1;
                    Err(BreakerError::Open {
                        name: self.config.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.stats.total_calls += 1;
        inner.stats.success_count += 1;
        inner.stats.consecutive_successes += 1;
        inner.stats.consecutive_failures = 0;
        inner.stats.last_success_time = Some(Utc::now());

        if inner.state == CircuitState::HalfOpen
            && inner.stats.consecutive_successes >= self.config.success_threshold
        {
            inner.state = CircuitState::Closed;
            tracing::info!(
                breaker = %self.config.name,
                successes = inner.stats.consecutive_successes,
                "Circuit breaker closed"
            );
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.stats.total_calls += 1;
        inner.stats.failure_count += 1;
        inner.stats.consecutive_failures += 1;
        inner.stats.consecutive_successes = 0;
        inner.stats.last_failure_time = Some(Utc::now());
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(breaker = %self.config.name, "Circuit breaker re-opened, probe failed");
            }
            CircuitState::Closed
                if inner.stats.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                tracing::error!(
                    breaker = %self.config.name,
                    failures = inner.stats.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    fn on_neutral(&self, probe: bool) {
        if probe {
            self.lock().probe_in_flight = false;
        }
    }
}

/// Frees the half-open probe slot if the call future is dropped mid-flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_neutral(true);
            tracing::debug!(breaker = %self.breaker.config.name, "Probe call cancelled");
        }
    }
}
