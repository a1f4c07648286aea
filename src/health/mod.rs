//! Health check endpoints

use crate::gateway::session::ShardStatus;
use crate::gateway::state::{ShardRegistry, ShardSummary};
use crate::metrics::GatewayMetrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shards_total: usize,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub status: ShardStatus,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub ping_ms: Option<f64>,
    pub events_received: u64,
    pub shards: Vec<ShardSummary>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub registry: ShardRegistry,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shards_total: state.registry.shard_count(),
    })
}

/// Readiness endpoint - returns 200 once the aggregate status is connected
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.registry.aggregate_status();
    let is_ready = status == ShardStatus::Connected;

    let response = ReadyResponse {
        ready: is_ready,
        status,
        shards_total: state.registry.shard_count(),
        shards_ready: state.registry.ready_shards(),
        ping_ms: state
            .registry
            .average_ping()
            .map(|d| d.as_secs_f64() * 1000.0),
        events_received: state.registry.total_events_received(),
        shards: state.registry.summaries(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    for snapshot in state.registry.snapshots() {
        state
            .metrics
            .set_shard_status(snapshot.shard_id, snapshot.status);
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
