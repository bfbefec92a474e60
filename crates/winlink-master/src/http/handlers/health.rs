//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::state::MasterState;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<MasterState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "started_at": state.started_at.to_rfc3339(),
        "strategy": state.scheduler.strategy_name(),
        "connected_workers": state.workers.connected_count().await,
        "tasks": state.registry.len().await,
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<MasterState>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&state).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
