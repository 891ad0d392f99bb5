//! Resilient Cache
//!
//! A caching and request-admission layer that sits between application
//! handlers and a shared Redis store:
//! - **Cache-aside reads/writes** with per-namespace TTLs
//! - **Stale-While-Revalidate**: serve stale entries while one background task refreshes them
//! - **Cache Stampede Protection**: distributed fetch locks so one caller hits the origin
//! - **Tag Invalidation**: delete every entry that depends on an entity in one call
//! - **Metrics**: hit/miss counters and latency samples shared by every instance
//! - **Rate Limiting**: fixed-window counters per client
//! - **Circuit Breaker**: every store call fails open once the store degrades
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use resilient_cache::CacheLayer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     resilient_cache::init_tracing();
//!     let layer = CacheLayer::new().await?;
//!     let cache = layer.cache_manager();
//!
//!     let key = cache.keys().user("42", "profile");
//!     let response = cache
//!         .get_with_fallback(&key, || async { Ok(serde_json::json!({"name": "alice"})) }, Duration::from_secs(300))
//!         .await?;
//!     tracing::info!(from_cache = response.from_cache, "Loaded profile");
//!
//!     let limit = layer.rate_limiter().check_default("10.0.0.1").await?;
//!     tracing::info!(remaining = limit.remaining, "Rate limit checked");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Rate Limiter → Cache Manager → (miss) fetch_fn → Tag Manager
//!                               ↓
//!                        Cache Metrics
//!
//! every store call ──→ Circuit Breaker ──→ KeyValueStore (Redis | Memory)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub mod backends;
pub mod blacklist;
pub mod builder;
pub mod cache_manager;
pub mod circuit_breaker;
pub mod codecs;
pub mod config;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod keys;
pub mod locks;
pub mod metrics;
pub mod rate_limiter;
pub mod tags;
pub mod traits;

pub use backends::MemoryStore;
#[cfg(feature = "redis")]
pub use backends::RedisStore;
pub use blacklist::TokenBlacklist;
pub use builder::CacheLayerBuilder;
pub use cache_manager::{CacheManager, CacheManagerStats, CacheResponse};
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
pub use codecs::JsonCodec;
pub use config::{CacheLayerConfig, HalfOpenPolicy};
pub use error::{CacheError, CacheResult, ConfigError};
pub use keys::{KeyBuilder, LockKind, Namespace};
pub use metrics::{CacheMetrics, MetricsSummary};
pub use rate_limiter::{RateLimitPolicy, RateLimitResult, RateLimiter};
pub use tags::CacheTagManager;
pub use traits::{CacheCodec, KeyTtl, KeyValueStore};

// Re-export async_trait for store implementations
pub use async_trait::async_trait;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Overall health as reported by [`CacheLayer::health_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Store reachable and circuit closed
    Healthy,
    /// Store unreachable or circuit not closed; the layer is failing open
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: &'static str,
    pub store_reachable: bool,
    pub latency_ms: u64,
    pub circuit: CircuitStatus,
}

/// Composition root: one store, one circuit breaker and every component built on them
///
/// Clone freely; all components are behind `Arc`.
#[derive(Clone)]
pub struct CacheLayer {
    config: CacheLayerConfig,
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    cache_manager: Arc<CacheManager>,
    tag_manager: Arc<CacheTagManager>,
    metrics: Arc<CacheMetrics>,
    rate_limiter: Arc<RateLimiter>,
    blacklist: Arc<TokenBlacklist>,
}

impl CacheLayer {
    /// Create the layer from environment configuration and a Redis store
    ///
    /// See [`CacheLayerConfig::from_env`] for the recognized variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Redis cannot be reached.
    #[cfg(feature = "redis")]
    pub async fn new() -> Result<Self> {
        CacheLayerBuilder::new()
            .with_config(CacheLayerConfig::from_env()?)
            .build()
            .await
    }

    /// Create the layer with default configuration against a custom Redis URL
    ///
    /// # Errors
    ///
    /// Returns an error if Redis cannot be reached.
    #[cfg(feature = "redis")]
    pub async fn with_redis_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing cache layer with custom Redis URL");
        let mut config = CacheLayerConfig::default();
        config.redis.url = redis_url.to_string();
        CacheLayerBuilder::new().with_config(config).build().await
    }

    /// Wire every component around an existing store
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn from_store(
        store: Arc<dyn KeyValueStore>,
        config: CacheLayerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let keys = KeyBuilder::new(config.key_version.clone());
        let breaker = Arc::new(CircuitBreaker::new(
            format!("{}-store", store.name().to_ascii_lowercase()),
            config.circuit_breaker.clone(),
        ));
        let metrics = Arc::new(CacheMetrics::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            keys.clone(),
            config.metrics.clone(),
        ));
        let cache_manager = Arc::new(CacheManager::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            Arc::clone(&metrics),
            &config,
        ));
        let tag_manager = Arc::new(CacheTagManager::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            Arc::clone(&cache_manager),
            config.ttl.tag,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            keys.clone(),
            RateLimitPolicy::from(&config.rate_limit),
        ));
        let blacklist = Arc::new(TokenBlacklist::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            keys,
        ));

        info!(
            store = store.name(),
            key_version = %config.key_version,
            "Cache layer initialized"
        );

        Ok(Self {
            config,
            store,
            breaker,
            cache_manager,
            tag_manager,
            metrics,
            rate_limiter,
            blacklist,
        })
    }

    /// Ping the store through the circuit breaker
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let store = &self.store;
        let ping = self.breaker.call(|| async move { store.ping().await }).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let circuit = self.breaker.status();
        let store_reachable = ping.is_ok();
        let status = if store_reachable && circuit.state == CircuitState::Closed {
            HealthStatus::Healthy
        } else {
            warn!(
                store = self.store.name(),
                circuit = %circuit.state,
                "Cache layer health check - degraded"
            );
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            store: self.store.name(),
            store_reachable,
            latency_ms,
            circuit,
        }
    }

    /// Default TTL for entries in `namespace`
    #[must_use]
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        self.config.ttl.for_namespace(namespace)
    }

    #[must_use]
    pub fn config(&self) -> &CacheLayerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Cache-aside, SWR and stampede-protected reads (primary interface)
    #[must_use]
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    #[must_use]
    pub fn tag_manager(&self) -> &Arc<CacheTagManager> {
        &self.tag_manager
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn blacklist(&self) -> &Arc<TokenBlacklist> {
        &self.blacklist
    }
}
