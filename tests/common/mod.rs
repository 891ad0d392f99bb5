//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Cache layer setup over an in-memory store
//! - Test key and data generators
//! - A store wrapper that injects failures into selected operations
//! - Polling helpers for background work

#![allow(dead_code)]

use resilient_cache::config::{CircuitBreakerConfig, LockConfig};
use resilient_cache::{
    CacheError, CacheLayer, CacheLayerConfig, CacheResult, HalfOpenPolicy, KeyTtl, KeyValueStore,
    MemoryStore, async_trait,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration tuned for fast tests: short breaker timeout and lock polling
pub fn test_config() -> CacheLayerConfig {
    CacheLayerConfig {
        circuit_breaker: CircuitBreakerConfig {
            threshold: 3,
            timeout: Duration::from_millis(200),
            half_open: HalfOpenPolicy::SingleTrial,
        },
        lock: LockConfig {
            ttl: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_retries: 300,
        },
        ..CacheLayerConfig::default()
    }
}

/// Cache layer over a fresh in-memory store; the store handle lets tests simulate outages
pub fn setup_layer() -> (Arc<CacheLayer>, Arc<MemoryStore>) {
    setup_layer_with(test_config())
}

pub fn setup_layer_with(config: CacheLayerConfig) -> (Arc<CacheLayer>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let layer = CacheLayer::from_store(store.clone(), config)
        .unwrap_or_else(|e| panic!("Failed to build cache layer: {e}"));
    (Arc::new(layer), store)
}

/// Cache layer over an arbitrary store
pub fn setup_layer_over(store: Arc<dyn KeyValueStore>) -> Arc<CacheLayer> {
    let layer = CacheLayer::from_store(store, test_config())
        .unwrap_or_else(|e| panic!("Failed to build cache layer: {e}"));
    Arc::new(layer)
}

/// In-memory store that fails selected operations and delegates everything else
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    /// Set keys whose SMEMBERS fails
    broken_sets: Vec<String>,
    /// Fail every standalone EXPIRE
    broken_expire: bool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broken_set(mut self, key: &str) -> Self {
        self.broken_sets.push(key.to_string());
        self
    }

    pub fn with_broken_expire(mut self) -> Self {
        self.broken_expire = true;
        self
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.inner.set_nx_ex(key, value, ttl).await
    }
    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.inner.del(keys).await
    }
    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.inner.incr(key).await
    }
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        self.inner.incr_with_expiry(key, ttl).await
    }
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        if self.broken_expire {
            return Err(CacheError::Timeout(Duration::from_millis(5)));
        }
        self.inner.expire(key, ttl).await
    }
    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        self.inner.ttl(key).await
    }
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.inner.scan(pattern).await
    }
    async fn sadd(&self, key: &str, members: &[String]) -> CacheResult<u64> {
        self.inner.sadd(key, members).await
    }
    async fn srem(&self, key: &str, member: &str) -> CacheResult<u64> {
        self.inner.srem(key, member).await
    }
    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        if self.broken_sets.iter().any(|broken| broken == key) {
            return Err(CacheError::Command("simulated SMEMBERS failure".to_string()));
        }
        self.inner.smembers(key).await
    }
    async fn scard(&self, key: &str) -> CacheResult<u64> {
        self.inner.scard(key).await
    }
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CacheResult<i64> {
        self.inner.hincr_by(key, field, delta).await
    }
    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, i64>> {
        self.inner.hget_all(key).await
    }
    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> CacheResult<()> {
        self.inner.lpush_trim(key, value, max_len).await
    }
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }
    async fn ping(&self) -> CacheResult<()> {
        self.inner.ping().await
    }
    async fn info(&self) -> CacheResult<String> {
        self.inner.info().await
    }
}

/// Create a versioned key in `namespace` with a unique identifier
pub fn test_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:{name}_{}:v1", rand::random::<u32>())
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct User {
        pub id: u64,
        pub name: String,
        pub email: String,
    }

    impl User {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                name: format!("User {id}"),
                email: format!("user{id}@example.com"),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Roadmap {
        pub id: u64,
        pub title: String,
        pub steps: Vec<String>,
    }

    impl Roadmap {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                title: format!("Roadmap {id}"),
                steps: (1..=3).map(|n| format!("Step {n}")).collect(),
            }
        }
    }

    /// Generate JSON test data
    pub fn json_user(id: u64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("User {id}"),
            "email": format!("user{id}@example.com"),
        })
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}

/// Assert that process-local cache stats meet expectations
#[macro_export]
macro_rules! assert_cache_stats {
    ($layer:expr, $field:ident > $value:expr) => {
        let stats = $layer.cache_manager().stats();
        assert!(
            stats.$field > $value,
            "Expected {} > {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
    ($layer:expr, $field:ident == $value:expr) => {
        let stats = $layer.cache_manager().stats();
        assert_eq!(
            stats.$field,
            $value,
            "Expected {} == {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("user", "profile");
        let key2 = test_key("user", "profile");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("user:profile_"));
        assert!(key1.ends_with(":v1"));
    }

    #[test]
    fn test_config_is_valid() {
        test_config()
            .validate()
            .unwrap_or_else(|e| panic!("test config invalid: {e}"));
    }
}
