//! Cache Codec Implementations
//!
//! Built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec) trait.
//! Cached entries are JSON so that the HTTP response cache can serve them verbatim.

mod json;
pub use json::JsonCodec;
