//! # Circuit Breaker
//!
//! Protects the rest of the system from a degraded store. Every store access
//! made by the caching layer passes through one process-local breaker with
//! three states: Closed (normal operation), Open (failing fast) and Half-Open
//! (testing recovery).
//!
//! Only store failures ([`CacheError::is_store_failure`]) count against the
//! breaker. Programmer errors and decode failures mean the store answered.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::{CircuitBreakerConfig, HalfOpenPolicy};
use crate::error::{CacheError, CacheResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - calls fail fast without touching the store
    Open,
    /// Testing recovery - trial calls decide whether to close or reopen
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Serializable snapshot of a breaker, reported by metrics and the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub timeout_ms: u64,
    /// Milliseconds since the last recorded failure, if any
    pub last_failure_ms_ago: Option<u64>,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Frees the single half-open trial slot if the trial future is dropped
/// before it records an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
            debug!(component = %self.breaker.name, "Half-open trial abandoned, slot released");
        }
    }
}

/// Process-local circuit breaker guarding store access
///
/// State lives behind a `parking_lot::Mutex` that is only held for the
/// admission decision and for recording the outcome, never across an
/// `.await`, so concurrent calls in `CLOSED` run in parallel.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            threshold = config.threshold,
            timeout_ms = config.timeout.as_millis(),
            half_open = ?config.half_open,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. A pure read: an expired `OPEN` stays `OPEN` until the
    /// next call is admitted as a trial.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.config.threshold,
            timeout_ms: u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
            last_failure_ms_ago: inner
                .last_failure
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` through the breaker, surfacing its result
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CircuitOpen`] without running `operation` when the
    /// circuit rejects the call, otherwise whatever `operation` returned.
    pub async fn call<F, Fut, T>(&self, operation: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.admit() else {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::CircuitOpen(self.name.clone()));
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = operation().await;

        guard.disarm();
        match &result {
            Err(e) if e.is_store_failure() => self.record_failure(e),
            _ => self.record_success(),
        }

        result
    }

    /// Run `operation`, returning `fallback()` when the circuit is open or the
    /// operation fails
    pub async fn execute<F, Fut, T, D>(&self, operation: F, fallback: D) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
        D: FnOnce() -> T,
    {
        match self.call(operation).await {
            Ok(value) => value,
            Err(e) => {
                debug!(component = %self.name, error = %e, "Store call failed, using fallback");
                fallback()
            }
        }
    }

    /// [`execute`](Self::execute) with `T::default()` as the fallback
    pub async fn execute_or_default<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
        T: Default,
    {
        self.execute(operation, T::default).await
    }

    /// Force the circuit closed and clear the failure history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        drop(inner);

        info!(component = %self.name, previous = %previous, "Circuit breaker reset (forced closed)");
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed < self.config.timeout {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(
                    component = %self.name,
                    open_for_ms = elapsed.as_millis(),
                    "Circuit breaker half-open (testing recovery)"
                );
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen => match self.config.half_open {
                HalfOpenPolicy::Concurrent => Some(Admission::Normal),
                HalfOpenPolicy::SingleTrial if inner.trial_in_flight => None,
                HalfOpenPolicy::SingleTrial => {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            },
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            info!(component = %self.name, "Circuit breaker closed (recovered)");
        }
    }

    fn record_failure(&self, err: &CacheError) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let reopen = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.config.threshold,
            CircuitState::Open => false,
        };

        if reopen {
            inner.state = CircuitState::Open;
            error!(
                component = %self.name,
                failure_count = inner.failure_count,
                threshold = self.config.threshold,
                timeout_ms = self.config.timeout.as_millis(),
                error = %err,
                "Circuit breaker opened (failing fast)"
            );
        } else {
            debug!(
                component = %self.name,
                failure_count = inner.failure_count,
                error = %err,
                "Store failure recorded"
            );
        }
    }
}
