//! Tag-based bulk invalidation
//!
//! A tag is a store set (`tag:{name}:{version}`) listing the cache keys that
//! depend on some entity. Invalidating the tag deletes every listed key and
//! then the set itself.
//!
//! Invalidation does not remove the deleted keys from *other* tag sets. Those
//! dangling references are harmless: deleting an absent key is a no-op, and
//! tag sets expire on their own after the tag TTL.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache_manager::CacheManager;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::CacheResult;
use crate::keys::KeyBuilder;
use crate::traits::KeyValueStore;

#[derive(Clone)]
pub struct CacheTagManager {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<CacheManager>,
    keys: KeyBuilder,
    tag_ttl: Duration,
}

impl CacheTagManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<CacheManager>,
        tag_ttl: Duration,
    ) -> Self {
        let keys = cache.keys().clone();
        Self {
            store,
            breaker,
            cache,
            keys,
            tag_ttl,
        }
    }

    /// Register `key` under `tag`
    pub async fn tag(&self, tag: &str, key: &str) -> bool {
        self.tag_many(tag, &[key.to_string()]).await
    }

    /// Register several keys under `tag` and refresh the tag-set TTL
    pub async fn tag_many(&self, tag: &str, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }

        let tag_key = self.keys.tag(tag);
        let store = &self.store;
        let ttl = self.tag_ttl;
        let result = self
            .breaker
            .call(|| async {
                let added = store.sadd(&tag_key, keys).await?;
                store.expire(&tag_key, ttl).await?;
                Ok(added)
            })
            .await;

        match result {
            Ok(added) => {
                debug!(tag = %tag, added = added, "[Tags] Registered keys");
                true
            }
            Err(e) => {
                debug!(tag = %tag, error = %e, "[Tags] Could not register keys");
                false
            }
        }
    }

    /// Keys currently registered under `tag`
    pub async fn get_tagged_keys(&self, tag: &str) -> Vec<String> {
        let tag_key = self.keys.tag(tag);
        let store = &self.store;
        self.breaker
            .execute_or_default(|| async { store.smembers(&tag_key).await })
            .await
    }

    /// Delete every key registered under `tag`, then the tag set itself
    ///
    /// An empty or unknown tag is a successful no-op. Returns `false` only when
    /// the store could not complete the invalidation.
    pub async fn invalidate_tag(&self, tag: &str) -> bool {
        let tag_key = self.keys.tag(tag);
        let store = &self.store;
        let result = self
            .breaker
            .call(|| async {
                let members = store.smembers(&tag_key).await?;
                if members.is_empty() {
                    return Ok(0);
                }
                let removed = store.del(&members).await?;
                store.del(std::slice::from_ref(&tag_key)).await?;
                Ok(removed)
            })
            .await;

        match result {
            Ok(removed) => {
                info!(tag = %tag, removed = removed, "[Tags] Invalidated tag");
                true
            }
            Err(e) => {
                warn!(tag = %tag, error = %e, "[Tags] Invalidation failed");
                false
            }
        }
    }

    /// Invalidate tags concurrently; each tag succeeds or fails on its own.
    /// Returns how many succeeded.
    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let outcomes = join_all(tags.iter().map(|tag| self.invalidate_tag(tag.as_ref()))).await;
        let succeeded = outcomes.into_iter().filter(|ok| *ok).count();
        if succeeded < tags.len() {
            warn!(
                requested = tags.len(),
                succeeded = succeeded,
                "[Tags] Partial bulk invalidation"
            );
        }
        succeeded
    }

    /// Write an entry and register it under every tag
    ///
    /// Tags are only registered once the entry was written.
    ///
    /// # Errors
    ///
    /// Same as [`CacheManager::set`].
    pub async fn set_with_tags<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: &[&str],
    ) -> CacheResult<bool> {
        if !self.cache.set(key, value, ttl).await? {
            return Ok(false);
        }

        let keys = [key.to_string()];
        let registered = join_all(tags.iter().map(|tag| self.tag_many(tag, &keys))).await;
        Ok(registered.into_iter().all(|ok| ok))
    }

    /// Remove `key` from `tag` without deleting the entry
    pub async fn untag_key(&self, tag: &str, key: &str) -> bool {
        let tag_key = self.keys.tag(tag);
        let store = &self.store;
        self.breaker
            .execute_or_default(|| async { store.srem(&tag_key, key).await })
            .await
            > 0
    }

    /// Number of keys registered under `tag`
    pub async fn get_tag_size(&self, tag: &str) -> u64 {
        let tag_key = self.keys.tag(tag);
        let store = &self.store;
        self.breaker
            .execute_or_default(|| async { store.scard(&tag_key).await })
            .await
    }

    /// Names of every tag of the current key version
    pub async fn list_tags(&self) -> Vec<String> {
        let pattern = self.keys.tag_pattern();
        let store = &self.store;
        let tag_keys: Vec<String> = self
            .breaker
            .execute_or_default(|| async { store.scan(&pattern).await })
            .await;

        let mut names: Vec<String> = tag_keys
            .iter()
            .filter_map(|k| self.keys.tag_name(k))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }
}
