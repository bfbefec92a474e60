//! HTTP request and response types.

use std::collections::BTreeMap;

use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use winlink_core::{
    Payload, Priority, ResourceLimits, ResourceUsage, Task, TaskError, TaskId, TaskStatus,
    WorkerId,
};

use crate::persistence::PersistenceError;
use crate::workers::WorkerSnapshot;

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error mapped to an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: err.to_string(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let status = match &err {
            TaskError::TaskNotFound(_) | TaskError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            TaskError::InvalidTask(_) | TaskError::ResourceLimitExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            TaskError::AlreadyTerminal { .. }
            | TaskError::StaleUpdate { .. }
            | TaskError::InvalidTransition { .. }
            | TaskError::NotQueued { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Task types
// ============================================================================

/// Query string for the task list.
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
}

/// Task row in the list endpoint; output is only returned by the detail view.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub resources: ResourceLimits,
    pub progress: u8,
    pub assigned_worker: Option<WorkerId>,
    pub unschedulable: bool,
    pub dispatch_count: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.metadata.name.clone(),
            status: task.status,
            priority: task.priority,
            resources: task.resources,
            progress: task.progress,
            assigned_worker: task.assigned_worker.clone(),
            unschedulable: task.unschedulable,
            dispatch_count: task.dispatch_count,
            created_at: task.metadata.created_at,
            finished_at: task.finished_at,
            error_reason: task.error_reason.clone(),
        }
    }
}

/// Response body for task submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// Request body for cancellation. The body may be omitted entirely.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: String,
}

/// Response body for cancellation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    pub previous: TaskStatus,
    pub status: TaskStatus,
}

// ============================================================================
// Worker list types
// ============================================================================

/// Response for a single worker.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub state: String,
    pub load: u32,
    pub max_tasks: u32,
    pub cpu_percent: u32,
    pub memory_mb: u64,
    pub free_cpu: u32,
    pub free_memory_mb: u64,
    pub usage: Option<ResourceUsage>,
    pub success_rate: f64,
    pub avg_duration_secs: f64,
    pub finished_tasks: u64,
    pub last_heartbeat: String,
    pub tasks: Vec<TaskId>,
}

impl From<WorkerSnapshot> for WorkerResponse {
    fn from(w: WorkerSnapshot) -> Self {
        Self {
            state: w.state.as_str().to_string(),
            load: w.load,
            max_tasks: w.info.capacity.max_tasks,
            cpu_percent: w.info.capacity.cpu_percent,
            memory_mb: w.info.capacity.memory_mb,
            free_cpu: w.free_cpu,
            free_memory_mb: w.free_memory_mb,
            usage: w.usage,
            success_rate: w.performance.success_rate,
            avg_duration_secs: w.performance.avg_duration_secs,
            finished_tasks: w.performance.finished(),
            last_heartbeat: w.last_heartbeat.to_rfc3339(),
            tasks: w.assigned,
            worker_id: w.info.worker_id,
            hostname: w.info.hostname,
            address: w.info.address,
            version: w.info.version,
        }
    }
}

// ============================================================================
// Statistics types
// ============================================================================

/// Aggregate figures over the tasks the registry holds.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Share of finished, non-cancelled tasks that succeeded.
    pub success_rate: Option<f64>,
    /// Mean run time of finished tasks that started.
    pub avg_execution_secs: Option<f64>,
    /// Counts keyed `code:<interpreter>` or `template:<name>`.
    pub by_kind: BTreeMap<String, usize>,
}

impl TaskStatistics {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut stats = Self {
            total: tasks.len(),
            ..Self::default()
        };
        let (mut succeeded, mut unsuccessful) = (0usize, 0usize);
        let (mut timed, mut total_secs) = (0usize, 0.0f64);

        for task in tasks {
            *stats.by_status.entry(task.status.as_str().to_string()).or_default() += 1;
            let kind = match &task.payload {
                Payload::Code { interpreter, .. } => format!("code:{}", interpreter),
                Payload::Template { name, .. } => format!("template:{}", name),
            };
            *stats.by_kind.entry(kind).or_default() += 1;

            match task.status {
                TaskStatus::Succeeded => succeeded += 1,
                TaskStatus::Failed | TaskStatus::TimedOut => unsuccessful += 1,
                _ => {}
            }
            if let Some(elapsed) = task.execution_time() {
                timed += 1;
                total_secs += elapsed.as_secs_f64();
            }
        }

        if succeeded + unsuccessful > 0 {
            stats.success_rate = Some(succeeded as f64 / (succeeded + unsuccessful) as f64);
        }
        if timed > 0 {
            stats.avg_execution_secs = Some(total_secs / timed as f64);
        }
        stats
    }
}

/// Aggregate figures over the worker set.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub total: usize,
    pub connected: usize,
    pub active_tasks: u32,
    /// Means over workers that reported usage.
    pub avg_cpu_percent: Option<f64>,
    pub avg_memory_percent: Option<f64>,
    pub avg_success_rate: Option<f64>,
}

impl WorkerStatistics {
    pub fn from_snapshots(workers: &[WorkerSnapshot]) -> Self {
        let usage: Vec<&ResourceUsage> = workers.iter().filter_map(|w| w.usage.as_ref()).collect();
        let mean = |values: Vec<f64>| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };

        Self {
            total: workers.len(),
            connected: workers.iter().filter(|w| w.is_connected()).count(),
            active_tasks: workers.iter().map(|w| w.load).sum(),
            avg_cpu_percent: mean(usage.iter().map(|u| u.cpu_percent as f64).collect()),
            avg_memory_percent: mean(usage.iter().map(|u| u.memory_percent as f64).collect()),
            avg_success_rate: mean(workers.iter().map(|w| w.performance.success_rate).collect()),
        }
    }
}

/// Response body for `/v1/stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub tasks: TaskStatistics,
    pub workers: WorkerStatistics,
    pub strategy: String,
}

/// Query string for worker usage history.
#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    /// Look-back window in hours, 24 when omitted.
    pub hours: Option<u32>,
}

