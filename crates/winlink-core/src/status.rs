//! Status enums for Tasks and Workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task in the master's registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task accepted and waiting for a worker.
    #[default]
    Queued,
    /// Task sent to a worker, not yet started.
    Dispatched,
    /// Task actively executing on its worker.
    Running,
    /// Task exited successfully.
    Succeeded,
    /// Task failed (non-zero exit, launch error or local policy rejection).
    Failed,
    /// Task exceeded its wall-clock limit and was terminated.
    TimedOut,
    /// Task was cancelled by an explicit request.
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::TimedOut,
        TaskStatus::Cancelled,
    ];

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }

    /// Returns true if the task is bound to a worker.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    /// Whether `next` is reachable from this status.
    ///
    /// Besides the forward edges, cancellation is reachable from every
    /// non-terminal status and an active task may be returned to the queue
    /// when its worker is lost.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Dispatched) | (Queued, Cancelled) => true,
            (Dispatched, Running) | (Dispatched, Failed) | (Dispatched, Cancelled) => true,
            (Dispatched, Queued) | (Running, Queued) => true,
            (Running, Running)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, TimedOut)
            | (Running, Cancelled) => true,
            _ => false,
        }
    }

    /// Wire/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Dispatched => "DISPATCHED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a worker as seen by the master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Registered and heartbeating.
    #[default]
    Connected,
    /// Connection lost or heartbeats missed; tasks held until the grace period ends.
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
