//! Error types for store, cache and configuration failures

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the caching layer
///
/// Store-side variants (`Connection`, `Timeout`, `Command`, `Rejected`,
/// `CircuitOpen`) are recovered locally by every component and never reach
/// end users. The
/// `InvalidTtl` and `InvalidRateLimit` variants are programmer errors and are
/// always surfaced to the caller.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be reached
    #[error("store connection error: {0}")]
    Connection(String),

    /// A store command did not complete within the command timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store failed to execute a command
    #[error("store command failed: {0}")]
    Command(String),

    /// A healthy store refused the command itself (wrong type, bad argument)
    #[error("store rejected command: {0}")]
    Rejected(String),

    /// The circuit breaker rejected the call without touching the store
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// A cached payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A TTL of zero (or a stale TTL shorter than the fresh TTL) was supplied
    #[error("invalid TTL for '{key}': {reason}")]
    InvalidTtl { key: String, reason: &'static str },

    /// A rate-limit policy with a zero budget or zero window was supplied
    #[error("invalid rate limit for '{identifier}': {reason}")]
    InvalidRateLimit {
        identifier: String,
        reason: &'static str,
    },
}

impl CacheError {
    /// True for failures that should count against the circuit breaker
    ///
    /// [`Rejected`](Self::Rejected) is excluded: the store answered, so it is
    /// reachable even though this particular command was refused.
    #[must_use]
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Command(_)
        )
    }

    pub(crate) fn zero_ttl(key: &str) -> Self {
        Self::InvalidTtl {
            key: key.to_string(),
            reason: "TTL must be greater than zero",
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else if is_refused_command(&err) {
            Self::Rejected(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// `ERR` and `WRONGTYPE` replies, and replies that do not fit the expected type
#[cfg(feature = "redis")]
fn is_refused_command(err: &redis::RedisError) -> bool {
    use redis::{ErrorKind, ServerErrorKind};

    matches!(
        err.kind(),
        ErrorKind::Server(ServerErrorKind::ResponseError) | ErrorKind::UnexpectedReturnType
    ) || err.code() == Some("WRONGTYPE")
}

/// Result type for cache and store operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised while loading or validating [`CacheLayerConfig`](crate::config::CacheLayerConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("failed to parse {name}={value:?}: {reason}")]
    Parse {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// A value parsed but is outside its allowed range
    #[error("invalid configuration for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
