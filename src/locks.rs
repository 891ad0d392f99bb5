//! Distributed locks for stampede prevention
//!
//! A lock is a key in the `lock` namespace holding a random token, created
//! with an atomic set-if-absent and a short expiry. A holder that crashes
//! loses the lock when it expires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{CacheError, CacheResult};
use crate::traits::KeyValueStore;

/// Result of a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// This caller now holds the lock
    Acquired,
    /// Another caller holds the lock
    Held,
    /// The store could not be asked (circuit open or store failure)
    Unavailable,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    /// One set-if-absent attempt on `lock_key`
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTtl`] for a zero `ttl`.
    pub async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> CacheResult<LockOutcome> {
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl(lock_key));
        }

        let token = Uuid::new_v4().to_string();
        let store = &self.store;
        let result = self
            .breaker
            .call(|| async move { store.set_nx_ex(lock_key, token.as_bytes(), ttl).await })
            .await;

        Ok(match result {
            Ok(true) => {
                debug!(lock_key = %lock_key, ttl_ms = ttl.as_millis(), "[Lock] Acquired");
                LockOutcome::Acquired
            }
            Ok(false) => LockOutcome::Held,
            Err(e) => {
                warn!(lock_key = %lock_key, error = %e, "[Lock] Store unavailable while acquiring");
                LockOutcome::Unavailable
            }
        })
    }

    /// Release by deleting the lock key; `false` if it was already gone or the
    /// store is unavailable
    pub async fn release(&self, lock_key: &str) -> bool {
        let keys = [lock_key.to_string()];
        let store = &self.store;
        let removed = self
            .breaker
            .execute_or_default(|| async move { store.del(&keys).await })
            .await;
        debug!(lock_key = %lock_key, released = removed > 0, "[Lock] Released");
        removed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::config::CircuitBreakerConfig;

    fn manager() -> (Arc<MemoryStore>, LockManager) {
        let store = Arc::new(MemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new("locks", CircuitBreakerConfig::default()));
        let locks = LockManager::new(store.clone(), breaker);
        (store, locks)
    }

    #[tokio::test]
    async fn test_second_acquire_sees_held_until_release() {
        let (_, locks) = manager();
        let ttl = Duration::from_secs(5);

        assert_eq!(locks.try_acquire("lock:fetch:k:v1", ttl).await.ok(), Some(LockOutcome::Acquired));
        assert_eq!(locks.try_acquire("lock:fetch:k:v1", ttl).await.ok(), Some(LockOutcome::Held));
        assert!(locks.release("lock:fetch:k:v1").await);
        assert_eq!(locks.try_acquire("lock:fetch:k:v1", ttl).await.ok(), Some(LockOutcome::Acquired));
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_unavailable() {
        let (store, locks) = manager();
        store.set_available(false);
        let outcome = locks.try_acquire("lock:fetch:k:v1", Duration::from_secs(5)).await;
        assert_eq!(outcome.ok(), Some(LockOutcome::Unavailable));
        assert!(!locks.release("lock:fetch:k:v1").await);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let (_, locks) = manager();
        let outcome = locks.try_acquire("lock:fetch:k:v1", Duration::ZERO).await;
        assert!(matches!(outcome, Err(CacheError::InvalidTtl { .. })));
    }
}
