//! HTTP interception points (feature: `http`)
//!
//! - [`middleware`]: response caching, write invalidation and rate limiting for axum routers
//! - [`admin`]: health, metrics and reset endpoints

pub mod admin;
pub mod middleware;

pub use admin::{AdminState, router as admin_router};
pub use middleware::{
    InvalidationState, RateLimitState, ResponseCacheState, cache_response, client_identifier,
    enforce_rate_limit, invalidate_on_success,
};
