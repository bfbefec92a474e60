//! Task statistics and worker usage history.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use winlink_core::WorkerId;

use crate::http::responses::{
    ApiError, StatsResponse, TaskStatistics, UsageQuery, WorkerStatistics,
};
use crate::state::MasterState;

const DEFAULT_USAGE_HOURS: u32 = 24;

pub async fn get_stats(State(state): State<Arc<MasterState>>) -> impl IntoResponse {
    let tasks = state.registry.list().await;
    let workers = state.workers.snapshot().await;
    Json(StatsResponse {
        tasks: TaskStatistics::from_tasks(&tasks),
        workers: WorkerStatistics::from_snapshots(&workers),
        strategy: state.scheduler.strategy_name().to_string(),
    })
}

/// Usage samples a worker reported over the last `hours` (24 by default).
pub async fn worker_usage(
    State(state): State<Arc<MasterState>>,
    Path(worker_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = query.hours.unwrap_or(DEFAULT_USAGE_HOURS);
    let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
    let samples = state
        .usage_history(&WorkerId::new(worker_id), since)
        .await?;
    Ok(Json(samples))
}
