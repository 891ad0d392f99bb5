//! Integration tests for basic cache operations
//!
//! Tests get/set round trips, TTL expiry, cache-aside reads and fail-open behavior

mod common;

use common::*;
use resilient_cache::{CacheError, CircuitState, KeyTtl, KeyValueStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Test set then get returns the same typed value
#[tokio::test]
async fn test_set_get_round_trip() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("user", "round_trip");
    let user = test_data::User::new(1);

    let written = cache
        .set(&key, &user, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    assert!(written);

    let cached: Option<test_data::User> = cache.get(&key).await;
    assert_eq!(cached, Some(user));
}

/// Test entries disappear after their TTL
#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("quiz", "expiry");

    let _ = cache
        .set(&key, &test_data::json_user(2), Duration::from_millis(50))
        .await;
    assert!(cache.get::<serde_json::Value>(&key).await.is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(cache.get::<serde_json::Value>(&key).await.is_none());
}

/// Test every write carries a TTL
#[tokio::test]
async fn test_writes_always_have_ttl() {
    let (layer, store) = setup_layer();
    let key = test_key("roadmap", "ttl");

    let _ = layer
        .cache_manager()
        .set(&key, &test_data::Roadmap::new(3), Duration::from_secs(30))
        .await;

    match store.ttl(&key).await {
        Ok(KeyTtl::Expires(left)) => assert!(left <= Duration::from_secs(30)),
        other => panic!("expected an expiring key, got {other:?}"),
    }
}

/// Test zero TTL is a programmer error, not swallowed
#[tokio::test]
async fn test_zero_ttl_rejected() {
    let (layer, store) = setup_layer();
    let key = test_key("user", "zero_ttl");

    let result = layer.cache_manager().set(&key, &1, Duration::ZERO).await;
    assert!(matches!(result, Err(CacheError::InvalidTtl { .. })));
    assert_eq!(store.len(), 0, "nothing may be written without a TTL");

    let fetched = layer
        .cache_manager()
        .get_with_fallback(&key, || async { Ok(1) }, Duration::ZERO)
        .await;
    assert!(fetched.is_err());
}

/// Test cache-aside calls the origin exactly once
#[tokio::test]
async fn test_get_with_fallback_fetches_once() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("conv", "fallback");
    let calls = Arc::new(AtomicU32::new(0));

    for round in 0..3 {
        let counter = Arc::clone(&calls);
        let response = cache
            .get_with_fallback(
                &key,
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(test_data::User::new(5))
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap_or_else(|e| panic!("fallback failed: {e}"));

        assert_eq!(response.data, test_data::User::new(5));
        assert_eq!(response.from_cache, round > 0);
        assert!(!response.stale);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test origin errors propagate and nothing is cached
#[tokio::test]
async fn test_fetch_error_propagates() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("flashcard", "origin_error");

    let result = cache
        .get_with_fallback::<u32, _, _>(
            &key,
            || async { Err(anyhow::anyhow!("origin down")) },
            Duration::from_secs(60),
        )
        .await;

    let err = result.err().unwrap_or_else(|| panic!("expected an error"));
    assert_eq!(err.to_string(), "origin down");
    assert!(cache.get::<u32>(&key).await.is_none());
}

/// Test an unavailable store behaves as a miss and the origin still answers
#[tokio::test]
async fn test_store_outage_fails_open() {
    let (layer, store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("user", "outage");
    store.set_available(false);

    assert!(cache.get::<u32>(&key).await.is_none());
    let written = cache
        .set(&key, &7_u32, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("store failures must be swallowed: {e}"));
    assert!(!written);

    let response = cache
        .get_with_fallback(&key, || async { Ok(7_u32) }, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("fallback failed: {e}"));
    assert_eq!(response.data, 7);
    assert!(!response.from_cache);
}

/// Test an open circuit stops all store traffic
#[tokio::test]
async fn test_open_circuit_performs_no_store_operations() {
    let (layer, store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("user", "open_circuit");
    store.set_available(false);

    // Threshold is 3 in the test config
    for _ in 0..3 {
        let _ = cache.get::<u32>(&key).await;
    }
    assert_eq!(layer.circuit_breaker().state(), CircuitState::Open);
    assert!(cache.is_degraded());

    let before = store.operations();
    assert!(cache.get::<u32>(&key).await.is_none());
    let _ = cache.set(&key, &1_u32, Duration::from_secs(60)).await;
    assert!(!cache.del(&key).await);
    let limit = layer
        .rate_limiter()
        .check_limit("10.0.0.1", 5, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("rate limit failed: {e}"));
    assert!(limit.allowed);
    assert!(layer.tag_manager().get_tagged_keys("user:1").await.is_empty());
    assert_eq!(store.operations(), before, "open circuit must not touch the store");
}

/// Test the circuit recovers once the store comes back
#[tokio::test]
async fn test_circuit_recovers_after_timeout() {
    let (layer, store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("user", "recovery");
    store.set_available(false);

    for _ in 0..3 {
        let _ = cache.get::<u32>(&key).await;
    }
    assert_eq!(layer.circuit_breaker().state(), CircuitState::Open);

    store.set_available(true);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let written = cache
        .set(&key, &9_u32, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("set failed: {e}"));
    assert!(written);
    assert_eq!(layer.circuit_breaker().state(), CircuitState::Closed);
    assert_eq!(cache.get::<u32>(&key).await, Some(9));
}

/// Test reads of a key holding the wrong type are misses and leave the circuit closed
#[tokio::test]
async fn test_wrong_type_reads_do_not_open_circuit() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let tagged = test_key("user", "wrong_type");

    assert!(layer.tag_manager().tag("team:wrong_type", &tagged).await);
    let tag_key = cache.keys().tag("team:wrong_type");
    for _ in 0..5 {
        assert!(cache.get::<test_data::User>(&tag_key).await.is_none());
    }

    assert_eq!(layer.circuit_breaker().state(), CircuitState::Closed);
    let written = cache
        .set(&test_key("user", "after_wrong_type"), &test_data::User::new(3), Duration::from_secs(60))
        .await;
    assert!(matches!(written, Ok(true)));
}

/// Test an undecodable entry is treated as a miss and overwritten
#[tokio::test]
async fn test_undecodable_entry_is_a_miss() {
    let (layer, store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("roadmap", "corrupt");

    store
        .set_ex(&key, b"{not json", Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("raw write failed: {e}"));
    assert!(cache.get::<test_data::Roadmap>(&key).await.is_none());

    let response = cache
        .get_with_fallback(&key, || async { Ok(test_data::Roadmap::new(8)) }, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("fallback failed: {e}"));
    assert!(!response.from_cache);
    assert_eq!(cache.get::<test_data::Roadmap>(&key).await, Some(test_data::Roadmap::new(8)));
}

/// Test delete operations report what they removed
#[tokio::test]
async fn test_delete_operations() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let ttl = Duration::from_secs(60);
    let keys: Vec<String> = (0..3).map(|i| format!("quiz:del_{i}:v1")).collect();

    for key in &keys {
        let _ = cache.set(key, &1_u32, ttl).await;
    }
    let _ = cache.set("quiz:other:v1", &1_u32, ttl).await;

    assert!(cache.del(&keys[0]).await);
    assert!(!cache.del(&keys[0]).await);
    assert_eq!(cache.del_many(&keys).await, 2);

    for i in 0..4 {
        let _ = cache.set(&format!("quiz:bulk_{i}:v1"), &i, ttl).await;
    }
    assert_eq!(cache.del_pattern("quiz:bulk_*").await, 4);
    assert_eq!(cache.get::<u32>("quiz:other:v1").await, Some(1));
}

/// Test health check reflects store reachability
#[tokio::test]
async fn test_health_check() {
    let (layer, store) = setup_layer();

    let report = layer.health_check().await;
    assert_eq!(report.status, resilient_cache::HealthStatus::Healthy);
    assert!(report.store_reachable);
    assert_eq!(report.store, "Memory");

    store.set_available(false);
    let report = layer.health_check().await;
    assert_eq!(report.status, resilient_cache::HealthStatus::Degraded);
    assert!(!report.store_reachable);
}

/// Test process-local statistics count hits and misses
#[tokio::test]
async fn test_stats_track_lookups() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let key = test_key("user", "stats");

    let _ = cache.get::<u32>(&key).await;
    let _ = cache.set(&key, &1_u32, Duration::from_secs(60)).await;
    let _ = cache.get::<u32>(&key).await;
    let _ = cache.get::<u32>(&key).await;

    assert_cache_stats!(layer, hits == 2);
    assert_cache_stats!(layer, misses == 1);
    assert_cache_stats!(layer, total_requests == 3);
}

/// Test token revocation and its fail-open lookup
#[tokio::test]
async fn test_token_blacklist() {
    let (layer, store) = setup_layer();
    let blacklist = layer.blacklist();
    let token = format!("jwt-{}", rand::random::<u32>());

    assert!(!blacklist.is_revoked(&token).await);
    let revoked = blacklist
        .revoke(&token, Duration::from_secs(60))
        .await
        .unwrap_or_else(|e| panic!("revoke failed: {e}"));
    assert!(revoked);
    assert!(blacklist.is_revoked(&token).await);

    store.set_available(false);
    assert!(!blacklist.is_revoked(&token).await, "lookups fail open");
    store.set_available(true);

    assert!(blacklist.restore(&token).await);
    assert!(!blacklist.is_revoked(&token).await);
    assert!(blacklist.revoke(&token, Duration::ZERO).await.is_err());
}
