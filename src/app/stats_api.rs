//! Stats HTTP endpoint
//!
//! Live-flow JSON plus Prometheus metrics:
//! - GET /connections  snapshot of tracked flows
//! - GET /traffic      instantaneous up/down rates
//! - GET /metrics      Prometheus text format

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tracing::{info, warn};

use crate::stats::{metrics::REGISTRY, Manager};

async fn get_connections(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    Json(manager.snapshot())
}

async fn get_traffic(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let (up, down) = manager.rates();
    Json(json!({ "up": up, "down": down }))
}

async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("metrics encode failed: {}", e);
    }
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

/// Build the API router
pub fn build_api_router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/connections", get(get_connections))
        .route("/traffic", get(get_traffic))
        .route("/metrics", get(get_metrics))
        .with_state(manager)
}

/// Serve the stats API until the process exits
pub async fn start_api_server(addr: SocketAddr, manager: Arc<Manager>) {
    let app = build_api_router(manager);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("failed to bind stats API to {}: {}", addr, e);
            return;
        }
    };
    info!("stats API listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        warn!("stats API server error: {}", e);
    }
}
