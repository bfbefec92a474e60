//! Worker list handlers.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::http::responses::WorkerResponse;
use crate::state::MasterState;

/// List registered workers, connected or within their grace period.
pub async fn list_workers(State(state): State<Arc<MasterState>>) -> impl IntoResponse {
    let response: Vec<WorkerResponse> = state
        .workers
        .snapshot()
        .await
        .into_iter()
        .map(WorkerResponse::from)
        .collect();
    Json(response)
}

/// List nodes seen through discovery beacons.
pub async fn list_discovered(State(state): State<Arc<MasterState>>) -> impl IntoResponse {
    Json(state.discovered.list().await)
}
