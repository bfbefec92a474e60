//! Registry events for tracking task transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Task, TaskId, TaskStatus};

/// Kind of transition a [`TaskEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Task accepted into the queue.
    Submitted,
    /// Task bound to a worker.
    Dispatched,
    /// Worker reported the task running.
    Started,
    /// Progress or output arrived for a running task.
    Progress,
    /// Task reached a terminal status.
    Finished,
    /// Task returned to the queue after its worker was lost.
    Requeued,
    /// No connected worker can fit the task.
    Unschedulable,
    /// Task reloaded from history after a master restart.
    Restored,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Submitted => "submitted",
            TaskEventKind::Dispatched => "dispatched",
            TaskEventKind::Started => "started",
            TaskEventKind::Progress => "progress",
            TaskEventKind::Finished => "finished",
            TaskEventKind::Requeued => "requeued",
            TaskEventKind::Unschedulable => "unschedulable",
            TaskEventKind::Restored => "restored",
        }
    }
}

/// A task transition, carrying a snapshot of the task after it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub kind: TaskEventKind,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub task: Task,
}

impl TaskEvent {
    /// Create an event from the task's current state.
    pub fn new(kind: TaskEventKind, task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind,
            status: task.status,
            timestamp: Utc::now(),
            task: task.clone(),
        }
    }

    /// Returns true if this event records a terminal transition.
    pub fn is_terminal(&self) -> bool {
        self.kind == TaskEventKind::Finished && self.status.is_terminal()
    }
}
