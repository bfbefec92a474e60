//! Task submission, query and cancellation handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use winlink_core::{TaskError, TaskId, TaskSpec, TaskStatus};

use crate::http::responses::{
    ApiError, CancelRequest, CancelResponse, ListTasksQuery, SubmitResponse, TaskSummary,
};
use crate::state::MasterState;

/// List tasks in submission order, optionally filtered by status.
pub async fn list_tasks(
    State(state): State<Arc<MasterState>>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let tasks: Vec<TaskSummary> = state
        .registry
        .list()
        .await
        .iter()
        .filter(|t| query.status.map_or(true, |s| t.status == s))
        .map(TaskSummary::from)
        .collect();
    Json(tasks)
}

/// Full task record including accumulated output.
pub async fn get_task(
    State(state): State<Arc<MasterState>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::new(task_id);
    let task = state
        .registry
        .get(&task_id)
        .await
        .ok_or(TaskError::TaskNotFound(task_id))?;
    Ok(Json(task))
}

/// Submit a task. Omitted priority and resources take the configured defaults.
pub async fn submit_task(
    State(state): State<Arc<MasterState>>,
    body: Result<Json<TaskSpec>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(spec) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let task_id = state.submit_task(spec).await?;
    info!(task_id = %task_id, "Task submitted over HTTP");

    let status = state
        .registry
        .get(&task_id)
        .await
        .map(|t| t.status)
        .unwrap_or_default();
    Ok((StatusCode::CREATED, Json(SubmitResponse { task_id, status })))
}

/// Cancel a queued or running task.
pub async fn cancel_task(
    State(state): State<Arc<MasterState>>,
    Path(task_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::new(task_id);
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    let outcome = state.cancel_task(&task_id, &reason).await?;
    info!(task_id = %task_id, previous = %outcome.previous, "Task cancelled over HTTP");

    Ok(Json(CancelResponse {
        task_id,
        previous: outcome.previous,
        status: TaskStatus::Cancelled,
    }))
}
