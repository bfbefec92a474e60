//! Core domain errors.

use thiserror::Error;

use crate::{TaskId, TaskStatus, WorkerId};

/// Structured task outcomes returned by the registry and executor.
///
/// These are values handed back to the caller, never panics that unwind
/// across components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Priority or resource fields are missing or malformed.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Requested limits exceed what the executing node allows.
    #[error("ResourceLimitExceeded: {0}")]
    ResourceLimitExceeded(String),

    /// Update does not apply to the task's current state or assignment.
    #[error("Stale update for task {task_id} (status {current})")]
    StaleUpdate { task_id: TaskId, current: TaskStatus },

    /// Cancel requested on a finished task.
    #[error("Task {task_id} already terminal ({status})")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Transition outside the task state machine.
    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Task left the queue before it could be claimed.
    #[error("Task {task_id} is no longer queued ({status})")]
    NotQueued { task_id: TaskId, status: TaskStatus },

    /// Worker not known to the master.
    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),
}
