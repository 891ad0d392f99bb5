//! Store Backend Implementations
//!
//! Implementations of the [`KeyValueStore`](crate::traits::KeyValueStore) capability.
//!
//! # Available Backends
//!
//! - **Redis** - Shared store used in production, one instance for every process (feature: `redis`)
//! - **Memory** - `DashMap`-backed store with the same semantics, for local development and tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use resilient_cache::backends::{MemoryStore, RedisStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let redis = RedisStore::with_url("redis://127.0.0.1:6379").await?;
//! let memory = MemoryStore::new();
//! # Ok(())
//! # }
//! ```

pub mod memory_store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory_store::MemoryStore;

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
