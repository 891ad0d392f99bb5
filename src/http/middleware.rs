//! Axum middleware for response caching, write invalidation and rate limiting
//!
//! # Usage
//!
//! ```ignore
//! use axum::{Router, middleware, routing::get};
//! use resilient_cache::http::middleware::{cache_response, enforce_rate_limit, RateLimitState, ResponseCacheState};
//!
//! let cache_state = ResponseCacheState::new(layer.cache_manager().clone(), |parts| {
//!     Some(format!("roadmap:{}:v1", parts.uri.path()))
//! }, Duration::from_secs(3600))?;
//! let limit_state = RateLimitState::new(layer.rate_limiter().clone(), layer.rate_limiter().default_policy())?;
//!
//! let app = Router::new()
//!     .route("/roadmaps/{id}", get(get_roadmap))
//!     .layer(middleware::from_fn_with_state(cache_state, cache_response))
//!     .layer(middleware::from_fn_with_state(limit_state, enforce_rate_limit));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_TYPE, HeaderName, RETRY_AFTER},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::cache_manager::{CacheManager, Lookup};
use crate::error::{CacheError, CacheResult};
use crate::rate_limiter::{RateLimitPolicy, RateLimitResult, RateLimiter, unix_now};
use crate::tags::CacheTagManager;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Identifier used when a request carries no client address headers
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Value of the `X-Cache` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

type KeyFn = Arc<dyn Fn(&Parts) -> Option<String> + Send + Sync>;
type KeysFn = Arc<dyn Fn(&Parts) -> Vec<String> + Send + Sync>;
type IdentifierFn = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

// ============================================================================
// STATE
// ============================================================================

/// State for [`cache_response`]
#[derive(Clone)]
pub struct ResponseCacheState {
    cache: Arc<CacheManager>,
    key_fn: KeyFn,
    ttl: Duration,
}

impl ResponseCacheState {
    /// `key_fn` maps a request to its cache key; `None` skips caching for that request
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] for a zero `ttl`.
    pub fn new<F>(cache: Arc<CacheManager>, key_fn: F, ttl: Duration) -> CacheResult<Self>
    where
        F: Fn(&Parts) -> Option<String> + Send + Sync + 'static,
    {
        if ttl.is_zero() {
            return Err(CacheError::zero_ttl("response cache"));
        }
        Ok(Self {
            cache,
            key_fn: Arc::new(key_fn),
            ttl,
        })
    }
}

impl fmt::Debug for ResponseCacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCacheState")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// State for [`invalidate_on_success`]
#[derive(Clone)]
pub struct InvalidationState {
    cache: Arc<CacheManager>,
    tags: Arc<CacheTagManager>,
    keys_fn: KeysFn,
    tags_fn: KeysFn,
}

impl InvalidationState {
    /// Invalidates nothing until keys or tags are configured
    pub fn new(cache: Arc<CacheManager>, tags: Arc<CacheTagManager>) -> Self {
        Self {
            cache,
            tags,
            keys_fn: Arc::new(|_: &Parts| Vec::new()),
            tags_fn: Arc::new(|_: &Parts| Vec::new()),
        }
    }

    /// Keys to delete after a successful write
    #[must_use]
    pub fn with_keys<F>(mut self, keys_fn: F) -> Self
    where
        F: Fn(&Parts) -> Vec<String> + Send + Sync + 'static,
    {
        self.keys_fn = Arc::new(keys_fn);
        self
    }

    /// Tags to invalidate after a successful write
    #[must_use]
    pub fn with_tags<F>(mut self, tags_fn: F) -> Self
    where
        F: Fn(&Parts) -> Vec<String> + Send + Sync + 'static,
    {
        self.tags_fn = Arc::new(tags_fn);
        self
    }
}

/// State for [`enforce_rate_limit`]
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    identifier_fn: IdentifierFn,
}

impl RateLimitState {
    /// Limit clients identified by [`client_identifier`]
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidRateLimit`] for a zero budget or a sub-second window.
    pub fn new(limiter: Arc<RateLimiter>, policy: RateLimitPolicy) -> CacheResult<Self> {
        if policy.max_requests == 0 || policy.window.as_secs() == 0 {
            return Err(CacheError::InvalidRateLimit {
                identifier: "middleware policy".to_string(),
                reason: "max_requests and window must be at least 1",
            });
        }
        Ok(Self {
            limiter,
            policy,
            identifier_fn: Arc::new(client_identifier),
        })
    }

    /// Replace the client identifier (e.g. an authenticated user id)
    #[must_use]
    pub fn with_identifier<F>(mut self, identifier_fn: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.identifier_fn = Arc::new(identifier_fn);
        self
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Serve GET responses from the cache
///
/// - Non-GET requests and requests without a key pass through untouched
/// - Store unavailable or circuit open: pass through with `X-Cache: BYPASS`.
///   The read still goes through the circuit breaker, so an expired open
///   circuit gets its half-open trial from this request
/// - Hit: cached JSON body with `X-Cache: HIT`
/// - Miss: run the handler; a 2xx JSON response gets `X-Cache: MISS` and is
///   cached in the background. Anything else gets `X-Cache: BYPASS`
pub async fn cache_response(
    State(state): State<ResponseCacheState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let key = (state.key_fn)(&parts);
    let request = Request::from_parts(parts, body);
    let Some(key) = key else {
        return next.run(request).await;
    };

    match state.cache.lookup::<serde_json::Value>(&key).await {
        Lookup::Hit(cached) => {
            debug!(key = %key, "[HTTP] Serving cached response");
            let mut response = Json(cached).into_response();
            set_cache_headers(response.headers_mut(), CacheStatus::Hit, &key);
            return response;
        }
        Lookup::Unavailable => {
            let mut response = next.run(request).await;
            set_cache_headers(response.headers_mut(), CacheStatus::Bypass, &key);
            return response;
        }
        Lookup::Miss => {}
    }

    let response = next.run(request).await;
    if !response.status().is_success() || !is_json(response.headers()) {
        let mut response = response;
        set_cache_headers(response.headers_mut(), CacheStatus::Bypass, &key);
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key = %key, error = %e, "[HTTP] Failed to read response body");
            set_cache_headers(&mut parts.headers, CacheStatus::Bypass, &key);
            parts.status = StatusCode::INTERNAL_SERVER_ERROR;
            return Response::from_parts(parts, Body::empty());
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => {
            set_cache_headers(&mut parts.headers, CacheStatus::Miss, &key);
            let cache = Arc::clone(&state.cache);
            let ttl = state.ttl;
            tokio::spawn(async move {
                if let Err(e) = cache.set(&key, &value, ttl).await {
                    warn!(key = %key, error = %e, "[HTTP] Failed to cache response");
                }
            });
        }
        Err(_) => set_cache_headers(&mut parts.headers, CacheStatus::Bypass, &key),
    }

    Response::from_parts(parts, Body::from(bytes))
}

/// Delete keys and invalidate tags after a successful (2xx) response
///
/// Keys and tags are derived from the request before the handler runs.
pub async fn invalidate_on_success(
    State(state): State<InvalidationState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let keys = (state.keys_fn)(&parts);
    let tags = (state.tags_fn)(&parts);
    let request = Request::from_parts(parts, body);

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let removed = state.cache.del_many(&keys).await;
    let invalidated = state.tags.invalidate_tags(&tags).await;
    debug!(
        keys = keys.len(),
        removed = removed,
        tags = tags.len(),
        invalidated = invalidated,
        "[HTTP] Invalidated after write"
    );

    response
}

/// Count the request against its client's budget; reject with 429 once exceeded
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let identifier = (state.identifier_fn)(&parts);
    let request = Request::from_parts(parts, body);

    let result = match state.limiter.check(&identifier, &state.policy).await {
        Ok(result) => result,
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "[HTTP] Rate limit check rejected, allowing request");
            return next.run(request).await;
        }
    };

    if !result.allowed {
        return too_many_requests(&result);
    }

    let mut response = next.run(request).await;
    set_rate_limit_headers(response.headers_mut(), &result);
    response
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// First address in `X-Forwarded-For`, then `X-Real-IP`, then [`ANONYMOUS_CLIENT`]
#[must_use]
pub fn client_identifier(parts: &Parts) -> String {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header("x-real-ip"))
        .unwrap_or(ANONYMOUS_CLIENT)
        .to_string()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn set_cache_headers(headers: &mut HeaderMap, status: CacheStatus, key: &str) {
    headers.insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(X_CACHE_KEY, value);
    }
}

fn set_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_at));
}

fn too_many_requests(result: &RateLimitResult) -> Response {
    let retry_after = result.retry_after(unix_now());
    let body = json!({
        "error": "rate_limit_exceeded",
        "message": format!("Too many requests, retry in {retry_after} seconds"),
        "limit": result.limit,
        "retry_after": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    set_rate_limit_headers(headers, result);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
