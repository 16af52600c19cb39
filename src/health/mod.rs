//! Health check endpoints
//!
//! Plain HTTP alongside the WebSocket endpoint, for probes and operators.

use crate::metrics::{self, BeaconMetrics};
use crate::rpc::ConnectionHub;
use crate::shard::{PoolRegistry, ShardSnapshot};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub channels: usize,
    pub peers_connected: usize,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PoolRegistry>,
    pub hub: Arc<ConnectionHub>,
    pub metrics: BeaconMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/pools", get(pools_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - the beacon accepts work as soon as it listens
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ReadyResponse {
            ready: true,
            channels: state.registry.len(),
            peers_connected: state.hub.peer_count(),
        }),
    )
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::set_peers_connected(state.hub.peer_count());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

/// Lock-free view of every channel's pool
async fn pools_handler(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, Arc<ShardSnapshot>>> {
    Json(state.registry.snapshots())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }

    #[test]
    fn test_ready_response_serialization() {
        let response = ReadyResponse {
            ready: true,
            channels: 2,
            peers_connected: 5,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"peers_connected\":5"));
    }
}
