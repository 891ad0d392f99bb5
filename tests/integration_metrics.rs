//! Integration tests for store-backed metrics

mod common;

use common::*;
use std::time::Duration;

/// Test cache reads feed the per-namespace counters
#[tokio::test]
async fn test_reads_record_hits_and_misses() {
    let (layer, _store) = setup_layer();
    let cache = layer.cache_manager();
    let metrics = layer.metrics();
    let key = test_key("roadmap", "metrics");

    let _ = cache.get::<u32>(&key).await;
    let _ = cache.set(&key, &1_u32, Duration::from_secs(60)).await;
    for _ in 0..3 {
        let _ = cache.get::<u32>(&key).await;
    }

    assert!((metrics.get_hit_ratio("roadmap").await - 75.0).abs() < f64::EPSILON);
    assert!((metrics.get_hit_ratio("total").await - 75.0).abs() < f64::EPSILON);
    assert!(metrics.get_hit_ratio("quiz").await.abs() < f64::EPSILON);
    assert!(metrics.get_avg_latency("roadmap").await >= 0.0);
}

/// Test the summary covers every cacheable namespace and the store figures
#[tokio::test]
async fn test_summary() {
    let (layer, _store) = setup_layer();
    let metrics = layer.metrics();

    metrics.record_hit("user").await;
    metrics.record_hit("user").await;
    metrics.record_miss("quiz").await;
    metrics.record_latency("user", Duration::from_millis(2)).await;
    metrics.record_latency("user", Duration::from_millis(4)).await;

    let summary = metrics.get_summary().await;
    for ns in ["conv", "roadmap", "flashcard", "quiz", "user"] {
        assert!(summary.namespaces.contains_key(ns), "missing namespace {ns}");
    }

    let user = summary
        .namespaces
        .get("user")
        .unwrap_or_else(|| panic!("user namespace missing"));
    assert_eq!(user.hits, 2);
    assert!((user.hit_ratio - 100.0).abs() < f64::EPSILON);
    assert!((user.avg_latency_ms - 3.0).abs() < 0.01);

    assert_eq!(summary.overall.hits, 2);
    assert_eq!(summary.overall.misses, 1);
    assert_eq!(summary.server.version, "memory-store");
    assert!(summary.server.total_keys > 0);
    assert!(summary.memory.used_bytes > 0);
    assert_eq!(summary.circuit.state, resilient_cache::CircuitState::Closed);
}

/// Test the latency ring keeps only the most recent samples
#[tokio::test]
async fn test_latency_ring_is_bounded() {
    let mut config = test_config();
    config.metrics.latency_samples = 3;
    let (layer, _store) = setup_layer_with(config);
    let metrics = layer.metrics();

    for ms in [100, 100, 1, 1, 1] {
        metrics.record_latency("flashcard", Duration::from_millis(ms)).await;
    }

    assert!((metrics.get_avg_latency("flashcard").await - 1.0).abs() < 0.01);
}

/// Test reset clears counters and samples
#[tokio::test]
async fn test_reset() {
    let (layer, _store) = setup_layer();
    let metrics = layer.metrics();

    metrics.record_hit("conv").await;
    metrics.record_latency("conv", Duration::from_millis(5)).await;
    assert!(metrics.reset().await);

    let summary = metrics.get_summary().await;
    assert_eq!(summary.overall.hits, 0);
    assert!(summary.overall.avg_latency_ms.abs() < f64::EPSILON);
}

/// Test an unavailable store yields zeroed figures instead of errors
#[tokio::test]
async fn test_unavailable_store_reports_zeroes() {
    let (layer, store) = setup_layer();
    let metrics = layer.metrics();
    metrics.record_hit("user").await;

    store.set_available(false);
    metrics.record_hit("user").await;

    let summary = metrics.get_summary().await;
    assert_eq!(summary.overall.hits, 0);
    assert_eq!(summary.memory.used_human, "0B");
    assert!(summary.server.version.is_empty());
    assert!(!metrics.reset().await);
}
