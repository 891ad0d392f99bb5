//! Administrative endpoints
//!
//! | Route | Effect |
//! |---|---|
//! | `GET /health` | store reachability and circuit status |
//! | `GET /metrics` | metrics summary plus this process's cache statistics |
//! | `POST /metrics/reset` | delete every metric counter and latency sample |
//! | `POST /circuit/reset` | force the circuit breaker closed |
//! | `DELETE /rate-limit/{identifier}` | drop every window counter of one client |
//!
//! Mount behind whatever authentication the host application uses.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::cache_manager::CacheManagerStats;
use crate::metrics::MetricsSummary;
use crate::{CacheLayer, HealthReport};

#[derive(Clone)]
pub struct AdminState {
    layer: Arc<CacheLayer>,
}

impl AdminState {
    pub fn new(layer: Arc<CacheLayer>) -> Self {
        Self { layer }
    }
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    summary: MetricsSummary,
    process: CacheManagerStats,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/metrics/reset", post(reset_metrics))
        .route("/circuit/reset", post(reset_circuit))
        .route("/rate-limit/{identifier}", delete(reset_rate_limit))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> Json<HealthReport> {
    Json(state.layer.health_check().await)
}

async fn metrics(State(state): State<AdminState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        summary: state.layer.metrics().get_summary().await,
        process: state.layer.cache_manager().stats(),
    })
}

async fn reset_metrics(State(state): State<AdminState>) -> Json<Value> {
    let reset = state.layer.metrics().reset().await;
    Json(json!({ "reset": reset }))
}

async fn reset_circuit(State(state): State<AdminState>) -> Json<Value> {
    let breaker = state.layer.circuit_breaker();
    breaker.reset();
    Json(json!({ "reset": true, "circuit": breaker.status() }))
}

async fn reset_rate_limit(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
) -> Json<Value> {
    let removed = state.layer.rate_limiter().reset(&identifier).await;
    Json(json!({ "identifier": identifier, "removed": removed }))
}
