//! Cache Metrics - hit/miss counters and latency samples kept in the store
//!
//! Counters live in two hashes (`metric:hits:{v}`, `metric:misses:{v}`) with
//! one field per namespace plus `total`. Each namespace also has a bounded
//! list of recent read latencies in milliseconds. Every metric key carries a
//! retention expiry refreshed on write.
//!
//! Metrics are shared by every process using the same store, unlike the
//! process-local [`CacheManagerStats`](crate::cache_manager::CacheManagerStats).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitStatus};
use crate::config::MetricsConfig;
use crate::keys::{KeyBuilder, Namespace};
use crate::traits::KeyValueStore;

/// Hash field holding the sum over every namespace
const TOTAL_FIELD: &str = "total";

/// Hit/miss/latency figures for one namespace
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of reads that were hits, 0 when there were no reads
    pub hit_ratio: f64,
    pub avg_latency_ms: f64,
}

/// Memory section of the store's `INFO` report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub used_human: String,
    pub peak_bytes: u64,
    pub peak_human: String,
    pub fragmentation_ratio: f64,
}

impl Default for MemoryUsage {
    fn default() -> Self {
        Self {
            used_bytes: 0,
            used_human: "0B".to_string(),
            peak_bytes: 0,
            peak_human: "0B".to_string(),
            fragmentation_ratio: 0.0,
        }
    }
}

/// Server, client and keyspace sections of the store's `INFO` report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_seconds: u64,
    pub connected_clients: u64,
    pub ops_per_sec: u64,
    pub total_commands: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub total_keys: u64,
}

/// Everything the `/metrics` endpoint reports
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub namespaces: BTreeMap<String, NamespaceStats>,
    pub overall: NamespaceStats,
    pub memory: MemoryUsage,
    pub server: ServerInfo,
    pub circuit: CircuitStatus,
    /// Unix timestamp (seconds) when the summary was assembled
    pub generated_at: u64,
}

/// Store-backed metrics recorder
///
/// Recording never fails the caller: store errors and an open circuit are
/// logged at `debug` and dropped.
#[derive(Clone)]
pub struct CacheMetrics {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    keys: KeyBuilder,
    config: MetricsConfig,
}

impl CacheMetrics {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        breaker: Arc<CircuitBreaker>,
        keys: KeyBuilder,
        config: MetricsConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            keys,
            config,
        }
    }

    pub async fn record_hit(&self, namespace: &str) {
        let key = self.keys.metric_hits();
        self.bump(&key, namespace).await;
    }

    pub async fn record_miss(&self, namespace: &str) {
        let key = self.keys.metric_misses();
        self.bump(&key, namespace).await;
    }

    /// Push a read latency onto the namespace's ring, trimming the oldest samples
    pub async fn record_latency(&self, namespace: &str, latency: Duration) {
        let key = self.keys.metric_latency(namespace);
        let sample = format!("{:.3}", latency.as_secs_f64() * 1000.0);
        let store = &self.store;
        let max_len = self.config.latency_samples;
        let retention = self.config.retention;

        let result = self
            .breaker
            .call(|| async {
                store.lpush_trim(&key, &sample, max_len).await?;
                store.expire(&key, retention).await
            })
            .await;
        if let Err(e) = result {
            debug!(key = %key, error = %e, "[Metrics] Dropped latency sample");
        }
    }

    /// Hit percentage for `namespace` (`"total"` for every namespace)
    pub async fn get_hit_ratio(&self, namespace: &str) -> f64 {
        let (hits, misses) = self.counts_for(namespace).await;
        hit_ratio(hits, misses)
    }

    /// Mean of the retained latency samples, in milliseconds
    pub async fn get_avg_latency(&self, namespace: &str) -> f64 {
        let samples = self.latency_samples(namespace).await;
        mean(&samples)
    }

    pub async fn get_memory_usage(&self) -> MemoryUsage {
        self.info_fields()
            .await
            .map(|fields| parse_memory(&fields))
            .unwrap_or_default()
    }

    pub async fn get_server_info(&self) -> ServerInfo {
        self.info_fields()
            .await
            .map(|fields| parse_server(&fields))
            .unwrap_or_default()
    }

    /// Per-namespace and overall figures plus store and circuit health
    pub async fn get_summary(&self) -> MetricsSummary {
        let hits = self.hash(&self.keys.metric_hits()).await;
        let misses = self.hash(&self.keys.metric_misses()).await;

        let mut namespaces = BTreeMap::new();
        let mut all_samples = Vec::new();
        for ns in Namespace::CACHEABLE {
            let name = ns.prefix();
            let samples = self.latency_samples(name).await;
            let ns_hits = counter(&hits, name);
            let ns_misses = counter(&misses, name);
            namespaces.insert(
                name.to_string(),
                NamespaceStats {
                    hits: ns_hits,
                    misses: ns_misses,
                    hit_ratio: hit_ratio(ns_hits, ns_misses),
                    avg_latency_ms: mean(&samples),
                },
            );
            all_samples.extend(samples);
        }

        let total_hits = counter(&hits, TOTAL_FIELD);
        let total_misses = counter(&misses, TOTAL_FIELD);
        let overall = NamespaceStats {
            hits: total_hits,
            misses: total_misses,
            hit_ratio: hit_ratio(total_hits, total_misses),
            avg_latency_ms: mean(&all_samples),
        };

        let fields = self.info_fields().await;
        let (memory, server) = fields
            .map(|f| (parse_memory(&f), parse_server(&f)))
            .unwrap_or_default();

        MetricsSummary {
            namespaces,
            overall,
            memory,
            server,
            circuit: self.breaker.status(),
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs(),
        }
    }

    /// Delete the hit/miss hashes and every latency ring
    pub async fn reset(&self) -> bool {
        let store = &self.store;
        let pattern = self.keys.metric_latency_pattern();
        let fixed = [self.keys.metric_hits(), self.keys.metric_misses()];

        let result = self
            .breaker
            .call(|| async {
                let mut keys = store.scan(&pattern).await?;
                keys.extend(fixed);
                store.del(&keys).await
            })
            .await;

        match result {
            Ok(removed) => {
                info!(removed = removed, "[Metrics] Reset all counters and latency samples");
                true
            }
            Err(e) => {
                debug!(error = %e, "[Metrics] Reset failed");
                false
            }
        }
    }

    async fn bump(&self, key: &str, namespace: &str) {
        let store = &self.store;
        let retention = self.config.retention;
        let result = self
            .breaker
            .call(|| async {
                store.hincr_by(key, namespace, 1).await?;
                store.hincr_by(key, TOTAL_FIELD, 1).await?;
                store.expire(key, retention).await
            })
            .await;
        if let Err(e) = result {
            debug!(key = %key, namespace = %namespace, error = %e, "[Metrics] Dropped counter update");
        }
    }

    async fn hash(&self, key: &str) -> HashMap<String, i64> {
        let store = &self.store;
        self.breaker
            .execute_or_default(|| async move { store.hget_all(key).await })
            .await
    }

    async fn counts_for(&self, namespace: &str) -> (u64, u64) {
        let hits = self.hash(&self.keys.metric_hits()).await;
        let misses = self.hash(&self.keys.metric_misses()).await;
        (counter(&hits, namespace), counter(&misses, namespace))
    }

    async fn latency_samples(&self, namespace: &str) -> Vec<f64> {
        let key = self.keys.metric_latency(namespace);
        let store = &self.store;
        let raw: Vec<String> = self
            .breaker
            .execute_or_default(|| async { store.lrange(&key, 0, -1).await })
            .await;
        raw.iter().filter_map(|s| s.parse::<f64>().ok()).collect()
    }

    async fn info_fields(&self) -> Option<HashMap<String, String>> {
        let store = &self.store;
        match self.breaker.call(|| async move { store.info().await }).await {
            Ok(text) => Some(parse_info(&text)),
            Err(e) => {
                debug!(error = %e, "[Metrics] INFO unavailable, reporting zeroed figures");
                None
            }
        }
    }
}

fn counter(hash: &HashMap<String, i64>, field: &str) -> u64 {
    hash.get(field)
        .and_then(|v| u64::try_from(*v).ok())
        .unwrap_or(0)
}

#[allow(clippy::cast_precision_loss)]
fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64 * 100.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Split an `INFO` report into `field -> value`, skipping section headers
fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn field<T: std::str::FromStr + Default>(fields: &HashMap<String, String>, name: &str) -> T {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn parse_memory(fields: &HashMap<String, String>) -> MemoryUsage {
    let defaults = MemoryUsage::default();
    MemoryUsage {
        used_bytes: field(fields, "used_memory"),
        used_human: fields
            .get("used_memory_human")
            .cloned()
            .unwrap_or(defaults.used_human),
        peak_bytes: field(fields, "used_memory_peak"),
        peak_human: fields
            .get("used_memory_peak_human")
            .cloned()
            .unwrap_or(defaults.peak_human),
        fragmentation_ratio: field(fields, "mem_fragmentation_ratio"),
    }
}

fn parse_server(fields: &HashMap<String, String>) -> ServerInfo {
    // Keyspace lines look like `db0:keys=12,expires=3,avg_ttl=0`
    let total_keys = fields
        .iter()
        .filter(|(k, _)| k.starts_with("db"))
        .filter_map(|(_, v)| {
            v.split(',')
                .find_map(|part| part.strip_prefix("keys="))
                .and_then(|n| n.parse::<u64>().ok())
        })
        .sum();

    ServerInfo {
        version: fields.get("redis_version").cloned().unwrap_or_default(),
        uptime_seconds: field(fields, "uptime_in_seconds"),
        connected_clients: field(fields, "connected_clients"),
        ops_per_sec: field(fields, "instantaneous_ops_per_sec"),
        total_commands: field(fields, "total_commands_processed"),
        keyspace_hits: field(fields, "keyspace_hits"),
        keyspace_misses: field(fields, "keyspace_misses"),
        total_keys,
    }
}
