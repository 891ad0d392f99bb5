//! Fixed-window rate limiter
//!
//! Each identifier gets one counter per window, keyed by
//! `floor(now / window)`. The counter and its expiry are written in one
//! atomic step, so it always expires with its window. Because
//! windows are fixed, a client can send up to twice the budget across a
//! window boundary.
//!
//! The limiter fails open: when the store is unavailable every request is
//! allowed.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::RateLimitConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyBuilder;
use crate::traits::KeyValueStore;

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests counted in the current window, including this one (0 when the store was unavailable)
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the current window ends
    pub reset_at: u64,
}

impl RateLimitResult {
    /// Seconds until the window resets, measured from `now_secs`
    #[must_use]
    pub fn retry_after(&self, now_secs: u64) -> u64 {
        self.reset_at.saturating_sub(now_secs).max(1)
    }
}

/// A request budget per window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u64,
    pub window: Duration,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    keys: KeyBuilder,
    default_policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        breaker: Arc<CircuitBreaker>,
        keys: KeyBuilder,
        default_policy: RateLimitPolicy,
    ) -> Self {
        Self {
            store,
            breaker,
            keys,
            default_policy,
        }
    }

    #[must_use]
    pub fn default_policy(&self) -> RateLimitPolicy {
        self.default_policy
    }

    /// Count one request from `identifier` against `max_requests` per `window`
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidRateLimit`] for a zero budget or a window shorter
    /// than one second. Store failures never surface; they allow the request.
    pub async fn check_limit(
        &self,
        identifier: &str,
        max_requests: u64,
        window: Duration,
    ) -> CacheResult<RateLimitResult> {
        let window_secs = window.as_secs();
        if max_requests == 0 {
            return Err(CacheError::InvalidRateLimit {
                identifier: identifier.to_string(),
                reason: "max_requests must be at least 1",
            });
        }
        if window_secs == 0 {
            return Err(CacheError::InvalidRateLimit {
                identifier: identifier.to_string(),
                reason: "window must be at least one second",
            });
        }

        let now = unix_now();
        let window_index = now / window_secs;
        let reset_at = (window_index + 1) * window_secs;
        let key = self.keys.rate_window(identifier, window_index);

        let store = &self.store;
        let result = self
            .breaker
            .call(|| async { store.incr_with_expiry(&key, window).await })
            .await;

        let current = match result {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(e) => {
                debug!(identifier = %identifier, error = %e, "[RateLimit] Store unavailable, allowing request");
                return Ok(RateLimitResult {
                    allowed: true,
                    current: 0,
                    limit: max_requests,
                    remaining: max_requests,
                    reset_at,
                });
            }
        };

        let allowed = current <= max_requests;
        if !allowed {
            warn!(
                identifier = %identifier,
                current = current,
                limit = max_requests,
                "[RateLimit] Request rejected"
            );
        }

        Ok(RateLimitResult {
            allowed,
            current,
            limit: max_requests,
            remaining: max_requests.saturating_sub(current),
            reset_at,
        })
    }

    /// [`check_limit`](Self::check_limit) with an explicit policy
    ///
    /// # Errors
    ///
    /// Same as [`check_limit`](Self::check_limit).
    pub async fn check(
        &self,
        identifier: &str,
        policy: &RateLimitPolicy,
    ) -> CacheResult<RateLimitResult> {
        self.check_limit(identifier, policy.max_requests, policy.window)
            .await
    }

    /// [`check_limit`](Self::check_limit) with the configured default policy
    ///
    /// # Errors
    ///
    /// Same as [`check_limit`](Self::check_limit).
    pub async fn check_default(&self, identifier: &str) -> CacheResult<RateLimitResult> {
        let policy = self.default_policy;
        self.check(identifier, &policy).await
    }

    /// Delete every window counter of `identifier`, returning how many were removed
    pub async fn reset(&self, identifier: &str) -> u64 {
        let pattern = self.keys.rate_pattern(identifier);
        let store = &self.store;
        let result = self
            .breaker
            .call(|| async {
                let keys = store.scan(&pattern).await?;
                store.del(&keys).await
            })
            .await;

        match result {
            Ok(removed) => {
                info!(identifier = %identifier, removed = removed, "[RateLimit] Reset counters");
                removed
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "[RateLimit] Reset failed");
                0
            }
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
