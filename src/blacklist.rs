//! Revoked-token blacklist
//!
//! Revoked tokens are stored under `blacklist:{token}:{version}` until their
//! natural expiry. Lookups fail open: if the store cannot be asked, the
//! token is treated as not revoked.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyBuilder;
use crate::traits::KeyValueStore;

const REVOKED_MARKER: &[u8] = b"1";

#[derive(Clone)]
pub struct TokenBlacklist {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    keys: KeyBuilder,
}

impl TokenBlacklist {
    pub fn new(store: Arc<dyn KeyValueStore>, breaker: Arc<CircuitBreaker>, keys: KeyBuilder) -> Self {
        Self {
            store,
            breaker,
            keys,
        }
    }

    /// Blacklist `token` for `ttl`, normally the token's remaining lifetime
    ///
    /// Returns `Ok(false)` if the store was unavailable.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] for a zero `ttl`.
    pub async fn revoke(&self, token: &str, ttl: Duration) -> CacheResult<bool> {
        let key = self.keys.blacklist(token);
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl(&key));
        }

        let store = &self.store;
        let result = self
            .breaker
            .call(|| async { store.set_ex(&key, REVOKED_MARKER, ttl).await })
            .await;

        match result {
            Ok(()) => {
                info!(ttl_secs = ttl.as_secs(), "[Blacklist] Token revoked");
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "[Blacklist] Could not record revocation");
                Ok(false)
            }
        }
    }

    pub async fn is_revoked(&self, token: &str) -> bool {
        let key = self.keys.blacklist(token);
        let store = &self.store;
        let found: Option<Vec<u8>> = self
            .breaker
            .execute_or_default(|| async { store.get(&key).await })
            .await;
        found.is_some()
    }

    /// Lift a revocation; `false` if the token was not blacklisted
    pub async fn restore(&self, token: &str) -> bool {
        let keys = [self.keys.blacklist(token)];
        let store = &self.store;
        self.breaker
            .execute_or_default(|| async { store.del(&keys).await })
            .await
            > 0
    }
}
