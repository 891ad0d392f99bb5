//! Redis Store - Distributed Store Backend
//!
//! Redis-backed [`KeyValueStore`] shared by every instance of the service.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::{KeyTtl, KeyValueStore};

/// Number of keys requested per SCAN round-trip
const SCAN_BATCH: usize = 100;

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Redis store with `ConnectionManager` for automatic reconnection
///
/// - Shared across every process instance, so locks and counters are global
/// - Automatic reconnection via `ConnectionManager`
/// - Every command bounded by the configured command timeout
/// - TTLs sent with millisecond precision (`PX`, `PEXPIRE`, `PTTL`)
pub struct RedisStore {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect using `REDIS_URL` (default `redis://127.0.0.1:6379`) and default timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url).await
    }

    /// Connect to a custom URL with default timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        Self::with_config(&RedisConfig {
            url: redis_url.to_string(),
            ..RedisConfig::default()
        })
        .await
    }

    /// Connect with explicit connect and command timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created, or if connecting and
    /// the initial PING do not complete within `connect_timeout`.
    pub async fn with_config(config: &RedisConfig) -> Result<Self> {
        info!(redis_url = %config.url, "Initializing Redis Store with ConnectionManager");

        let client = Client::open(config.url.as_str())
            .with_context(|| format!("Failed to create Redis client with URL: {}", config.url))?;

        let connect = async {
            let conn_manager = ConnectionManager::new(client)
                .await
                .context("Failed to establish Redis connection manager")?;

            let mut conn = conn_manager.clone();
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .context("Redis PING health check failed")?;

            Ok::<_, anyhow::Error>(conn_manager)
        };

        let conn_manager = timeout(config.connect_timeout, connect)
            .await
            .with_context(|| {
                format!(
                    "Timed out connecting to Redis at {} after {:?}",
                    config.url, config.connect_timeout
                )
            })??;

        info!(redis_url = %config.url, "Redis Store connected successfully (ConnectionManager enabled)");

        Ok(Self {
            conn_manager,
            command_timeout: config.command_timeout,
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> CacheResult<T> {
        let mut conn = self.conn_manager.clone();
        match timeout(self.command_timeout, cmd.query_async(&mut conn)).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.command_timeout)),
        }
    }

    async fn query_pipe<T: FromRedisValue>(&self, pipe: &redis::Pipeline) -> CacheResult<T> {
        let mut conn = self.conn_manager.clone();
        match timeout(self.command_timeout, pipe.query_async(&mut conn)).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.query::<()>(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis(ttl)))
            .await?;
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[Redis] Stored key with TTL");
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        // SET NX replies OK when written and nil when the key already exists
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let count: u64 = self.query(redis::cmd("DEL").arg(keys)).await?;
        debug!(count = count, "[Redis] Removed keys in bulk");
        Ok(count)
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        // PEXPIRE NX (Redis 7+) only sets an expiry on a key that has none
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .arg("NX")
            .ignore();
        let (count,): (i64,) = self.query_pipe(&pipe).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let updated: i64 = self
            .query(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        // PTTL: -2 = key doesn't exist, -1 = no expiry
        let ttl_ms: i64 = self.query(redis::cmd("PTTL").arg(key)).await?;
        Ok(match ttl_ms {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.unsigned_abs())),
        })
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;

            cursor = next;
            keys.extend(batch);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> CacheResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("SADD").arg(key).arg(members)).await
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<u64> {
        self.query(redis::cmd("SREM").arg(key).arg(member)).await
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn scard(&self, key: &str) -> CacheResult<u64> {
        self.query(redis::cmd("SCARD").arg(key)).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CacheResult<i64> {
        self.query(redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, i64>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> CacheResult<()> {
        let stop = isize::try_from(max_len).unwrap_or(isize::MAX) - 1;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(stop)
            .ignore();
        self.query_pipe::<()>(&pipe).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn ping(&self) -> CacheResult<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn info(&self) -> CacheResult<String> {
        self.query(&redis::cmd("INFO")).await
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
