//! Cache Manager - Cache-Aside, Stale-While-Revalidate and Stampede Protection
//!
//! Every store access goes through the shared [`CircuitBreaker`]. When the
//! store is unavailable reads behave as misses and writes are skipped, so
//! callers always fall through to their origin (`fetch_fn`).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::FutureExt;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info_span, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::codecs::JsonCodec;
use crate::config::{CacheLayerConfig, LockConfig};
use crate::error::{CacheError, CacheResult};
use crate::keys::{KeyBuilder, LockKind, namespace_of};
use crate::locks::{LockManager, LockOutcome};
use crate::metrics::CacheMetrics;
use crate::traits::{CacheCodec, KeyTtl, KeyValueStore};

/// Value returned by the read-through operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheResponse<T> {
    pub data: T,
    /// `true` if `data` was read from the store rather than produced by `fetch_fn`
    pub from_cache: bool,
    /// `true` if `data` is past its fresh TTL and a background refresh was scheduled
    pub stale: bool,
}

impl<T> CacheResponse<T> {
    fn cached(data: T) -> Self {
        Self {
            data,
            from_cache: true,
            stale: false,
        }
    }

    fn fetched(data: T) -> Self {
        Self {
            data,
            from_cache: false,
            stale: false,
        }
    }
}

/// Outcome of one metered read
#[derive(Debug)]
pub(crate) enum Lookup<T> {
    Hit(T),
    Miss,
    /// The circuit rejected the read or the store failed
    Unavailable,
}

/// Process-local statistics for one [`CacheManager`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheManagerStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub stale_served: u64,
    pub background_refreshes: u64,
    pub refreshes_skipped: u64,
    pub lock_waits: u64,
    pub unlocked_fallbacks: u64,
    pub in_flight_refreshes: usize,
}

/// Read-through cache over a shared [`KeyValueStore`]
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<CacheMetrics>,
    locks: LockManager,
    codec: JsonCodec,
    keys: KeyBuilder,
    lock_config: LockConfig,
    swr_multiplier: u32,
    /// Bounds concurrent background refreshes
    refresh_slots: Arc<Semaphore>,
    /// Statistics
    total_requests: Arc<AtomicU64>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    stale_served: Arc<AtomicU64>,
    background_refreshes: Arc<AtomicU64>,
    refreshes_skipped: Arc<AtomicU64>,
    lock_waits: Arc<AtomicU64>,
    unlocked_fallbacks: Arc<AtomicU64>,
    in_flight_refreshes: Arc<AtomicUsize>,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<CacheMetrics>,
        config: &CacheLayerConfig,
    ) -> Self {
        debug!(
            store = store.name(),
            refresh_concurrency = config.refresh_concurrency,
            swr_multiplier = config.swr_multiplier,
            "Initializing Cache Manager"
        );

        Self {
            locks: LockManager::new(Arc::clone(&store), Arc::clone(&breaker)),
            store,
            breaker,
            metrics,
            codec: JsonCodec,
            keys: KeyBuilder::new(config.key_version.clone()),
            lock_config: config.lock.clone(),
            swr_multiplier: config.swr_multiplier,
            refresh_slots: Arc::new(Semaphore::new(config.refresh_concurrency)),
            total_requests: Arc::new(AtomicU64::new(0)),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            stale_served: Arc::new(AtomicU64::new(0)),
            background_refreshes: Arc::new(AtomicU64::new(0)),
            refreshes_skipped: Arc::new(AtomicU64::new(0)),
            lock_waits: Arc::new(AtomicU64::new(0)),
            unlocked_fallbacks: Arc::new(AtomicU64::new(0)),
            in_flight_refreshes: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// `true` while the circuit breaker is not closed
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.breaker.is_closed()
    }

    /// Read and decode `key`
    ///
    /// Records a hit or miss and the read latency when the store answered.
    /// Returns `None` on a miss, an undecodable entry, a store failure or an
    /// open circuit.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.lookup(key).await {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Unavailable => None,
        }
    }

    /// [`get`](Self::get) that tells a miss apart from an unavailable store
    pub(crate) async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let store = &self.store;
        let raw = match self.breaker.call(|| async move { store.get(key).await }).await {
            Ok(raw) => raw,
            // The store answered and refused the read, e.g. a key of another type
            Err(e @ CacheError::Rejected(_)) => {
                log_swallowed("get", key, &e);
                None
            }
            Err(e) => {
                log_swallowed("get", key, &e);
                return Lookup::Unavailable;
            }
        };

        let value = raw.and_then(|bytes| self.decode(key, &bytes));
        self.observe(key, started.elapsed(), value.is_some()).await;
        value.map_or(Lookup::Miss, Lookup::Hit)
    }

    /// Serialize and store `value` under `key` for `ttl`
    ///
    /// Returns `Ok(true)` when written and `Ok(false)` when the store is
    /// unavailable (the failure is logged).
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] for a zero `ttl` and
    /// [`CacheError::Serialization`] if `value` cannot be encoded.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<bool> {
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl(key));
        }
        let bytes = self
            .codec
            .serialize(value)
            .map_err(|e| CacheError::Serialization(format!("{e:#}")))?;

        let store = &self.store;
        let bytes = &bytes;
        match self
            .breaker
            .call(|| async move { store.set_ex(key, bytes, ttl).await })
            .await
        {
            Ok(()) => {
                debug!(key = %key, ttl_ms = ttl.as_millis(), "[Cache] Stored entry");
                Ok(true)
            }
            Err(e) => {
                log_swallowed("set", key, &e);
                Ok(false)
            }
        }
    }

    /// Delete one entry; `false` if it did not exist or the store is unavailable
    pub async fn del(&self, key: &str) -> bool {
        self.del_many(&[key.to_string()]).await > 0
    }

    /// Delete entries in one round-trip, returning how many existed
    pub async fn del_many(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let store = &self.store;
        match self.breaker.call(|| async move { store.del(keys).await }).await {
            Ok(removed) => removed,
            Err(e) => {
                log_swallowed("del", &keys.join(","), &e);
                0
            }
        }
    }

    /// Delete every key matching a glob pattern (SCAN, then DEL)
    pub async fn del_pattern(&self, pattern: &str) -> u64 {
        let store = &self.store;
        let result = self
            .breaker
            .call(|| async move {
                let keys = store.scan(pattern).await?;
                store.del(&keys).await
            })
            .await;

        match result {
            Ok(removed) => {
                debug!(pattern = %pattern, removed = removed, "[Cache] Removed keys by pattern");
                removed
            }
            Err(e) => {
                log_swallowed("del_pattern", pattern, &e);
                0
            }
        }
    }

    /// Cache-aside read: return the cached value or call `fetch_fn` once and store its result
    ///
    /// # Errors
    ///
    /// Errors from `fetch_fn` are returned untouched. A zero `ttl` is
    /// rejected before anything else happens.
    pub async fn get_with_fallback<T, F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        ttl: Duration,
    ) -> Result<CacheResponse<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl(key).into());
        }

        if let Some(data) = self.get(key).await {
            return Ok(CacheResponse::cached(data));
        }

        let data = fetch_fn().await?;
        self.store_fetched(key, &data, ttl).await;
        Ok(CacheResponse::fetched(data))
    }

    /// Stale-while-revalidate read
    ///
    /// Entries are stored for `stale_ttl` (default `ttl * swr_multiplier`). An
    /// entry is fresh while its remaining lifetime exceeds `stale_ttl - ttl`;
    /// after that it is served with `stale = true` and refreshed in the
    /// background, at most one refresh per key across every instance.
    ///
    /// # Errors
    ///
    /// Errors from `fetch_fn` on a cold read, a zero `ttl`, or a `stale_ttl`
    /// shorter than `ttl`.
    pub async fn get_with_swr<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        fetch_fn: F,
        ttl: Duration,
        stale_ttl: Option<Duration>,
    ) -> Result<CacheResponse<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl(key).into());
        }
        let stale_ttl = stale_ttl.unwrap_or_else(|| ttl.saturating_mul(self.swr_multiplier));
        if stale_ttl < ttl {
            return Err(CacheError::InvalidTtl {
                key: key.to_string(),
                reason: "stale TTL must not be shorter than the fresh TTL",
            }
            .into());
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let store = &self.store;
        let lookup = self
            .breaker
            .call(|| async move {
                let Some(bytes) = store.get(key).await? else {
                    return Ok(None);
                };
                let remaining = store.ttl(key).await?;
                Ok(Some((bytes, remaining)))
            })
            .await;

        let entry = match lookup {
            Ok(found) => {
                let decoded = found.and_then(|(bytes, remaining)| {
                    self.decode::<T>(key, &bytes).map(|value| (value, remaining))
                });
                self.observe(key, started.elapsed(), decoded.is_some())
                    .await;
                decoded
            }
            Err(e) => {
                log_swallowed("get", key, &e);
                None
            }
        };

        let Some((data, remaining)) = entry else {
            return self.fetch_with_lock(key, fetch_fn, stale_ttl).await;
        };

        let stale_window = stale_ttl.saturating_sub(ttl);
        let fresh = match remaining {
            KeyTtl::Expires(left) => left > stale_window,
            KeyTtl::Persistent => true,
            // Expired between GET and PTTL
            KeyTtl::Missing => false,
        };

        if fresh {
            return Ok(CacheResponse::cached(data));
        }

        self.stale_served.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, remaining = ?remaining, "[Cache] Serving stale entry, scheduling refresh");
        self.spawn_refresh(key.to_string(), fetch_fn, stale_ttl);

        Ok(CacheResponse {
            data,
            from_cache: true,
            stale: true,
        })
    }

    /// Read-through with a distributed fetch lock so only one caller hits the origin
    ///
    /// The lock holder calls `fetch_fn` and stores the result. Everyone else
    /// polls the cache every `poll_interval` (plus jitter) for up to
    /// `max_retries` attempts, then fetches without the lock. If the lock
    /// cannot be requested at all (circuit open or store failure) the caller
    /// fetches immediately.
    ///
    /// # Errors
    ///
    /// Errors from `fetch_fn` are returned untouched (the lock is released
    /// first). A zero `ttl` is rejected.
    pub async fn fetch_with_lock<T, F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
        ttl: Duration,
    ) -> Result<CacheResponse<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl(key).into());
        }

        let lock_key = self.keys.lock(LockKind::Fetch, key);
        let mut waited = false;
        let mut attempt: u32 = 0;

        let holds_lock = loop {
            match self.locks.try_acquire(&lock_key, self.lock_config.ttl).await? {
                LockOutcome::Acquired => break true,
                LockOutcome::Unavailable => break false,
                LockOutcome::Held if attempt >= self.lock_config.max_retries => {
                    self.unlocked_fallbacks.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %key,
                        attempts = attempt,
                        "[Cache] Fetch lock still held after max retries, fetching without lock"
                    );
                    break false;
                }
                LockOutcome::Held => {
                    attempt += 1;
                    waited = true;
                    self.lock_waits.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.poll_delay()).await;

                    if let Some(data) = self.peek(key).await {
                        debug!(key = %key, attempts = attempt, "[Cache] Populated by lock holder");
                        return Ok(CacheResponse::cached(data));
                    }
                }
            }
        };

        // A holder that released just before we acquired may already have stored the value
        if holds_lock && waited {
            if let Some(data) = self.peek(key).await {
                self.locks.release(&lock_key).await;
                return Ok(CacheResponse::cached(data));
            }
        }

        let result = fetch_fn().await;
        if let Ok(data) = &result {
            self.store_fetched(key, data, ttl).await;
        }
        if holds_lock {
            self.locks.release(&lock_key).await;
        }

        result.map(CacheResponse::fetched)
    }

    /// Try to take `lock_key` once
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] for a zero `ttl`.
    pub async fn acquire_lock(&self, lock_key: &str, ttl: Duration) -> CacheResult<bool> {
        Ok(self.locks.try_acquire(lock_key, ttl).await? == LockOutcome::Acquired)
    }

    pub async fn release_lock(&self, lock_key: &str) -> bool {
        self.locks.release(lock_key).await
    }

    /// Get process-local cache statistics
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheManagerStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheManagerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits,
            misses,
            hit_rate: if lookups > 0 {
                (hits as f64 / lookups as f64) * 100.0
            } else {
                0.0
            },
            stale_served: self.stale_served.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            refreshes_skipped: self.refreshes_skipped.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            unlocked_fallbacks: self.unlocked_fallbacks.load(Ordering::Relaxed),
            in_flight_refreshes: self.in_flight_refreshes.load(Ordering::Relaxed),
        }
    }

    // ===== Internals =====

    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Option<T> {
        match self.codec.deserialize(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %format!("{e:#}"), "[Cache] Undecodable entry treated as miss");
                None
            }
        }
    }

    /// Read without recording statistics, for lock polling
    async fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = &self.store;
        match self.breaker.call(|| async move { store.get(key).await }).await {
            Ok(raw) => raw.and_then(|bytes| self.decode(key, &bytes)),
            Err(e) => {
                log_swallowed("get", key, &e);
                None
            }
        }
    }

    async fn observe(&self, key: &str, latency: Duration, hit: bool) {
        let namespace = namespace_of(key);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_hit(namespace).await;
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_miss(namespace).await;
        }
        self.metrics.record_latency(namespace, latency).await;
    }

    async fn store_fetched<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) {
        match self.set(key, data, ttl).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, "[Cache] Fetched value not cached, store unavailable"),
            Err(e) => warn!(key = %key, error = %e, "[Cache] Fetched value could not be cached"),
        }
    }

    fn poll_delay(&self) -> Duration {
        let base = self.lock_config.poll_interval;
        let max_jitter = u64::try_from(base.as_millis() / 4).unwrap_or(0);
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        base + Duration::from_millis(jitter)
    }

    fn spawn_refresh<T, F, Fut>(self: &Arc<Self>, key: String, fetch_fn: F, stale_ttl: Duration)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.refresh_slots).try_acquire_owned() else {
            self.refreshes_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "[Cache] Refresh pool saturated, skipping background refresh");
            return;
        };

        let manager = Arc::clone(self);
        let span = info_span!("swr_refresh", key = %key);
        let in_flight = InFlightGuard::enter(&self.in_flight_refreshes);

        tokio::spawn(
            async move {
                // Dropped in reverse order: the slot frees before the count falls
                let _in_flight = in_flight;
                let _permit = permit;
                manager.refresh(&key, fetch_fn, stale_ttl).await;
            }
            .instrument(span),
        );
    }

    async fn refresh<T, F, Fut>(&self, key: &str, fetch_fn: F, stale_ttl: Duration)
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock_key = self.keys.lock(LockKind::Refresh, key);
        match self.locks.try_acquire(&lock_key, self.lock_config.ttl).await {
            Ok(LockOutcome::Acquired) => {}
            Ok(LockOutcome::Held) => {
                self.refreshes_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "[Cache] Refresh already running elsewhere, skipping");
                return;
            }
            Ok(LockOutcome::Unavailable) | Err(_) => {
                self.refreshes_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "[Cache] Store unavailable, skipping refresh");
                return;
            }
        }

        let fetched = AssertUnwindSafe(async move { fetch_fn().await })
            .catch_unwind()
            .await;
        match fetched {
            Ok(Ok(data)) => {
                self.store_fetched(key, &data, stale_ttl).await;
                self.background_refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "[Cache] Background refresh stored");
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %format!("{e:#}"), "[Cache] Background refresh failed");
            }
            Err(_) => {
                warn!(key = %key, "[Cache] Background refresh panicked");
            }
        }

        self.locks.release(&lock_key).await;
    }
}

/// Counts one running refresh task until dropped
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn log_swallowed(operation: &'static str, key: &str, err: &CacheError) {
    if matches!(err, CacheError::CircuitOpen(_)) {
        debug!(operation, key = %key, "[Cache] Circuit open, skipping store");
    } else {
        warn!(operation, key = %key, error = %err, "[Cache] Store failure swallowed");
    }
}
