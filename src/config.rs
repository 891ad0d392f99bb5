//! Typed configuration for the caching layer
//!
//! Every recognized option is a field on [`CacheLayerConfig`]. Values come from
//! [`Default`] or from environment variables via [`CacheLayerConfig::from_env`],
//! and are checked once at startup by [`CacheLayerConfig::validate`].
//!
//! ```rust,no_run
//! use resilient_cache::config::CacheLayerConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = CacheLayerConfig::from_env()?;
//! assert!(config.swr_multiplier >= 1);
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::keys::Namespace;

/// Connection settings for the Redis store
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection string (e.g., `redis://127.0.0.1:6379`)
    pub url: String,
    /// Upper bound on establishing the connection manager and the initial PING
    pub connect_timeout: Duration,
    /// Upper bound on every individual command
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_millis(5000),
            command_timeout: Duration::from_millis(2000),
        }
    }
}

/// How the breaker admits calls while `HALF_OPEN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HalfOpenPolicy {
    /// One trial call in flight; everyone else sees the circuit as still open
    #[default]
    SingleTrial,
    /// Every caller may race a trial call through
    Concurrent,
}

impl FromStr for HalfOpenPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single_trial" => Ok(Self::SingleTrial),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(format!("expected 'single' or 'concurrent', got '{other}'")),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    pub timeout: Duration,
    /// Admission policy while half-open
    pub half_open: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_millis(30_000),
            half_open: HalfOpenPolicy::SingleTrial,
        }
    }
}

/// Default fixed-window rate limit
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-namespace default TTLs
#[derive(Debug, Clone)]
pub struct TtlDefaults {
    pub conversation: Duration,
    pub roadmap: Duration,
    pub flashcard: Duration,
    pub quiz: Duration,
    pub user: Duration,
    /// Fallback for namespaces without a dedicated TTL
    pub default: Duration,
    /// Lifetime of tag sets, refreshed on every registration
    pub tag: Duration,
}

impl Default for TtlDefaults {
    fn default() -> Self {
        Self {
            conversation: Duration::from_secs(1800),
            roadmap: Duration::from_secs(3600),
            flashcard: Duration::from_secs(3600),
            quiz: Duration::from_secs(1800),
            user: Duration::from_secs(300),
            default: Duration::from_secs(300),
            tag: Duration::from_secs(86_400),
        }
    }
}

impl TtlDefaults {
    /// TTL to use for entries in `namespace`
    #[must_use]
    pub fn for_namespace(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::Conversation => self.conversation,
            Namespace::Roadmap => self.roadmap,
            Namespace::Flashcard => self.flashcard,
            Namespace::Quiz => self.quiz,
            Namespace::User => self.user,
            Namespace::Tag => self.tag,
            _ => self.default,
        }
    }
}

/// Stampede-protection lock timings
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lock expiry; a crashed holder loses the lock after this long
    pub ttl: Duration,
    /// Sleep between polls while another caller holds the fetch lock
    pub poll_interval: Duration,
    /// Polls before giving up and fetching without the lock
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            max_retries: 50,
        }
    }
}

/// Metrics storage settings
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Capacity of each per-namespace latency ring
    pub latency_samples: usize,
    /// Expiry applied to metric keys on every write
    pub retention: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_samples: 100,
            retention: Duration::from_secs(604_800),
        }
    }
}

/// Top-level configuration for [`CacheLayer`](crate::CacheLayer)
#[derive(Debug, Clone)]
pub struct CacheLayerConfig {
    pub redis: RedisConfig,
    /// Global schema version appended to every key
    pub key_version: String,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub ttl: TtlDefaults,
    /// Physical entry lifetime under SWR is `ttl * swr_multiplier`
    pub swr_multiplier: u32,
    pub lock: LockConfig,
    /// Maximum number of concurrent background refreshes
    pub refresh_concurrency: usize,
    pub metrics: MetricsConfig,
}

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            key_version: "v1".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            ttl: TtlDefaults::default(),
            swr_multiplier: 2,
            lock: LockConfig::default(),
            refresh_concurrency: 16,
            metrics: MetricsConfig::default(),
        }
    }
}

impl CacheLayerConfig {
    /// Load configuration from the process environment and validate it
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but unparsable, or if the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup and validate it
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        let config = Self {
            redis: RedisConfig {
                url: env.string("REDIS_URL", defaults.redis.url),
                connect_timeout: env.millis(
                    "REDIS_CONNECT_TIMEOUT_MS",
                    defaults.redis.connect_timeout,
                )?,
                command_timeout: env.millis(
                    "REDIS_COMMAND_TIMEOUT_MS",
                    defaults.redis.command_timeout,
                )?,
            },
            key_version: env.string("CACHE_KEY_VERSION", defaults.key_version),
            circuit_breaker: CircuitBreakerConfig {
                threshold: env.parse(
                    "CIRCUIT_BREAKER_THRESHOLD",
                    defaults.circuit_breaker.threshold,
                )?,
                timeout: env.millis(
                    "CIRCUIT_BREAKER_TIMEOUT_MS",
                    defaults.circuit_breaker.timeout,
                )?,
                half_open: env.parse(
                    "CIRCUIT_BREAKER_HALF_OPEN",
                    defaults.circuit_breaker.half_open,
                )?,
            },
            rate_limit: RateLimitConfig {
                max_requests: env.parse(
                    "RATE_LIMIT_MAX_REQUESTS",
                    defaults.rate_limit.max_requests,
                )?,
                window: env.seconds("RATE_LIMIT_WINDOW_SECONDS", defaults.rate_limit.window)?,
            },
            ttl: TtlDefaults {
                conversation: env.seconds(
                    "CACHE_TTL_CONVERSATION_SECONDS",
                    defaults.ttl.conversation,
                )?,
                roadmap: env.seconds("CACHE_TTL_ROADMAP_SECONDS", defaults.ttl.roadmap)?,
                flashcard: env.seconds("CACHE_TTL_FLASHCARD_SECONDS", defaults.ttl.flashcard)?,
                quiz: env.seconds("CACHE_TTL_QUIZ_SECONDS", defaults.ttl.quiz)?,
                user: env.seconds("CACHE_TTL_USER_SECONDS", defaults.ttl.user)?,
                default: env.seconds("CACHE_TTL_DEFAULT_SECONDS", defaults.ttl.default)?,
                tag: env.seconds("CACHE_TTL_TAG_SECONDS", defaults.ttl.tag)?,
            },
            swr_multiplier: env.parse("CACHE_SWR_MULTIPLIER", defaults.swr_multiplier)?,
            lock: LockConfig {
                ttl: env.seconds("CACHE_LOCK_TTL_SECONDS", defaults.lock.ttl)?,
                poll_interval: env.millis("CACHE_LOCK_POLL_MS", defaults.lock.poll_interval)?,
                max_retries: env.parse("CACHE_LOCK_MAX_RETRIES", defaults.lock.max_retries)?,
            },
            refresh_concurrency: env.parse(
                "CACHE_REFRESH_CONCURRENCY",
                defaults.refresh_concurrency,
            )?,
            metrics: MetricsConfig {
                latency_samples: env.parse(
                    "CACHE_METRICS_LATENCY_SAMPLES",
                    defaults.metrics.latency_samples,
                )?,
                retention: env.seconds(
                    "CACHE_METRICS_RETENTION_SECONDS",
                    defaults.metrics.retention,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the layer's invariants
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
            if value.is_zero() {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                })
            } else {
                Ok(())
            }
        }

        if self.key_version.is_empty() || self.key_version.contains([':', '*', '?', '[', ']']) {
            return Err(ConfigError::Invalid {
                field: "key_version",
                reason: "must be non-empty and free of ':' and glob characters",
            });
        }
        if self.circuit_breaker.threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.threshold",
                reason: "must be at least 1",
            });
        }
        positive("circuit_breaker.timeout", self.circuit_breaker.timeout)?;
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.max_requests",
                reason: "must be at least 1",
            });
        }
        positive("rate_limit.window", self.rate_limit.window)?;
        positive("ttl.conversation", self.ttl.conversation)?;
        positive("ttl.roadmap", self.ttl.roadmap)?;
        positive("ttl.flashcard", self.ttl.flashcard)?;
        positive("ttl.quiz", self.ttl.quiz)?;
        positive("ttl.user", self.ttl.user)?;
        positive("ttl.default", self.ttl.default)?;
        positive("ttl.tag", self.ttl.tag)?;
        if self.swr_multiplier == 0 {
            return Err(ConfigError::Invalid {
                field: "swr_multiplier",
                reason: "must be at least 1",
            });
        }
        positive("lock.ttl", self.lock.ttl)?;
        positive("lock.poll_interval", self.lock.poll_interval)?;
        if self.refresh_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "refresh_concurrency",
                reason: "must be at least 1",
            });
        }
        if self.metrics.latency_samples == 0 {
            return Err(ConfigError::Invalid {
                field: "metrics.latency_samples",
                reason: "must be at least 1",
            });
        }
        positive("metrics.retention", self.metrics.retention)?;
        positive("redis.connect_timeout", self.redis.connect_timeout)?;
        positive("redis.command_timeout", self.redis.command_timeout)?;
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &'static str, default: String) -> String {
        (self.lookup)(name).unwrap_or(default)
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, default_ms).map(Duration::from_millis)
    }

    fn seconds(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }
}
