//! Store and Codec Traits
//!
//! This module defines the capability the caching layer needs from its shared
//! key-value store, plus the pluggable serialization codec.
//!
//! # Architecture
//!
//! - `KeyValueStore`: GET/SET/DEL/INCR/EXPIRE/SCAN/TTL, atomic set-if-absent
//!   and increment-with-expiry,
//!   plus the set, hash and list primitives used by tags and metrics
//! - `CacheCodec`: Trait for pluggable serialization backends
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use resilient_cache::{KeyValueStore, KeyTtl, CacheResult, async_trait};
//! use std::time::Duration;
//!
//! struct MyStore {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl KeyValueStore for MyStore {
//!     async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
//!         // Your implementation
//!     }
//!
//!     // ... implement the remaining primitives
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheResult;

/// Trait for cache value serialization/deserialization
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access
/// across async tasks.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or do not match `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Get the name of the codec, used for logging
    fn name(&self) -> &'static str;
}

/// Remaining lifetime of a key, as reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist (or has already expired)
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

/// Capability the caching layer requires from its shared store
///
/// Every method is a single round-trip (or an atomic pipeline) and reports
/// failures as [`CacheError`](crate::CacheError) instead of panicking.
/// Implementations bound each call with their own timeouts.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// component of a [`CacheLayer`](crate::CacheLayer).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, expiring after `ttl`
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Atomically store `value` only if `key` is absent
    ///
    /// Returns `true` if this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> CacheResult<u64>;

    /// Increment the integer under `key` by one, creating it at 1
    async fn incr(&self, key: &str) -> CacheResult<i64>;

    /// Atomically increment the integer under `key` and give it `ttl` if it
    /// has no expiry yet
    ///
    /// An existing expiry is left untouched, so every counter ends up with
    /// exactly one TTL no matter which increment created it.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64>;

    /// Set an expiry on an existing key; `false` if the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Remaining lifetime of `key`
    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl>;

    /// Every key matching a glob pattern (`*`, `?`, `[...]`, `\` escapes)
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Add members to the set under `key`, returning how many were new
    async fn sadd(&self, key: &str, members: &[String]) -> CacheResult<u64>;

    /// Remove a member from the set under `key`
    async fn srem(&self, key: &str, member: &str) -> CacheResult<u64>;

    /// All members of the set under `key`
    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>>;

    /// Cardinality of the set under `key`
    async fn scard(&self, key: &str) -> CacheResult<u64>;

    /// Increment a hash field by `delta`
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CacheResult<i64>;

    /// Every field of an integer hash
    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, i64>>;

    /// Push `value` to the head of a list and trim it to `max_len` entries
    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> CacheResult<()>;

    /// List range with Redis index semantics (negative indices count from the tail)
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>>;

    /// Round-trip connectivity check
    async fn ping(&self) -> CacheResult<()>;

    /// Diagnostic dump in Redis `INFO` format
    async fn info(&self) -> CacheResult<String>;

    /// Name of this store, used for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}
