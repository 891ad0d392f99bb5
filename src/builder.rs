//! Cache Layer Builder
//!
//! Builds a [`CacheLayer`] around a custom store or the default Redis store.
//!
//! # Example: Default Redis Store
//!
//! ```rust,no_run
//! use resilient_cache::CacheLayerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layer = CacheLayerBuilder::new().build().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: In-Memory Store
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use resilient_cache::{CacheLayerBuilder, MemoryStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let layer = CacheLayerBuilder::new()
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::CacheLayer;
use crate::config::CacheLayerConfig;
use crate::traits::KeyValueStore;

/// Builder for [`CacheLayer`]
///
/// Without [`with_store`](Self::with_store), `build` connects to Redis using
/// `config.redis` (requires the `redis` feature).
#[derive(Default)]
pub struct CacheLayerBuilder {
    store: Option<Arc<dyn KeyValueStore>>,
    config: Option<CacheLayerConfig>,
}

impl CacheLayerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom store instead of connecting to Redis
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use explicit configuration instead of [`CacheLayerConfig::default`]
    #[must_use]
    pub fn with_config(mut self, config: CacheLayerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the layer
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, if no store was
    /// supplied and Redis cannot be reached, or if no store was supplied
    /// and the `redis` feature is disabled.
    pub async fn build(self) -> Result<CacheLayer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => {
                info!(store = store.name(), "Building cache layer with custom store");
                store
            }
            None => default_store(&config).await?,
        };

        Ok(CacheLayer::from_store(store, config)?)
    }
}

#[cfg(feature = "redis")]
async fn default_store(config: &CacheLayerConfig) -> Result<Arc<dyn KeyValueStore>> {
    info!("Building cache layer with default Redis store");
    Ok(Arc::new(
        crate::backends::RedisStore::with_config(&config.redis).await?,
    ))
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn default_store(_config: &CacheLayerConfig) -> Result<Arc<dyn KeyValueStore>> {
    anyhow::bail!("no store configured and the `redis` feature is disabled")
}
