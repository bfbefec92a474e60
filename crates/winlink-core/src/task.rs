//! Task types: payload, priority, resource limits and the task record itself.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskError, TaskId, TaskStatus, WorkerId};

/// Dispatch priority. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits requested by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum CPU share in percent (1..=100).
    pub max_cpu: u32,

    /// Maximum resident memory in megabytes.
    pub max_memory_mb: u64,

    /// Maximum wall-clock duration in seconds.
    pub timeout_s: u64,
}

impl ResourceLimits {
    pub fn new(max_cpu: u32, max_memory_mb: u64, timeout_s: u64) -> Self {
        Self {
            max_cpu,
            max_memory_mb,
            timeout_s,
        }
    }

    /// Check that every limit is inside its valid range.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.max_cpu == 0 || self.max_cpu > 100 {
            return Err(TaskError::InvalidTask(format!(
                "max_cpu must be within 1..=100, got {}",
                self.max_cpu
            )));
        }
        if self.max_memory_mb == 0 {
            return Err(TaskError::InvalidTask(
                "max_memory_mb must be greater than zero".to_string(),
            ));
        }
        if self.timeout_s == 0 {
            return Err(TaskError::InvalidTask(
                "timeout_s must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu: 50,
            max_memory_mb: 512,
            timeout_s: 300,
        }
    }
}

/// What a task executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Source code handed to a named interpreter on the worker.
    Code { interpreter: String, source: String },

    /// A template installed on the worker, with string parameters.
    Template {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl Payload {
    pub fn code(interpreter: impl Into<String>, source: impl Into<String>) -> Self {
        Payload::Code {
            interpreter: interpreter.into(),
            source: source.into(),
        }
    }

    pub fn template(name: impl Into<String>) -> Self {
        Payload::Template {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        match self {
            Payload::Code {
                interpreter,
                source,
            } => {
                if interpreter.trim().is_empty() {
                    return Err(TaskError::InvalidTask("interpreter is required".to_string()));
                }
                if source.trim().is_empty() {
                    return Err(TaskError::InvalidTask("source code is empty".to_string()));
                }
            }
            Payload::Template { name, .. } => {
                if name.trim().is_empty() {
                    return Err(TaskError::InvalidTask("template name is required".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Descriptive task metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A submission request.
///
/// Priority and resources are optional here so that a missing field can be
/// reported as `InvalidTask` instead of silently defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub name: String,
    pub payload: Payload,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: None,
            resources: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = Some(resources);
        self
    }
}

/// A status report for one task, as produced by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub stdout_delta: String,
    #[serde(default)]
    pub stderr_delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl TaskUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: 0,
            stdout_delta: String::new(),
            stderr_delta: String::new(),
            error_reason: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout_delta = stdout.into();
        self.stderr_delta = stderr.into();
        self
    }

    pub fn with_error(mut self, reason: impl Into<String>) -> Self {
        self.error_reason = Some(reason.into());
        self
    }
}

/// The canonical task record held by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Name and creation time.
    pub metadata: TaskMetadata,

    /// What to execute.
    pub payload: Payload,

    /// Dispatch priority.
    pub priority: Priority,

    /// Resource limits enforced by the worker.
    pub resources: ResourceLimits,

    /// Current task status.
    pub status: TaskStatus,

    /// Worker bound to this task; `None` until dispatched.
    pub assigned_worker: Option<WorkerId>,

    /// Producer-reported completion percentage.
    pub progress: u8,

    /// Accumulated standard output.
    pub stdout: String,

    /// Accumulated standard error.
    pub stderr: String,

    /// Human-readable reason for failure, cancellation or requeue.
    pub error_reason: Option<String>,

    /// When execution started on the current worker.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Registry-assigned submission sequence (FIFO within a priority band).
    pub submit_seq: u64,

    /// Number of times the task has been dispatched.
    pub dispatch_count: u32,

    /// No connected worker can ever fit this task's limits.
    #[serde(default)]
    pub unschedulable: bool,
}

impl Task {
    /// Build a queued task from a submission request.
    pub fn from_spec(id: TaskId, spec: TaskSpec, submit_seq: u64) -> Result<Self, TaskError> {
        let priority = spec
            .priority
            .ok_or_else(|| TaskError::InvalidTask("priority is required".to_string()))?;
        let resources = spec
            .resources
            .ok_or_else(|| TaskError::InvalidTask("resources are required".to_string()))?;
        resources.validate()?;
        spec.payload.validate()?;

        let name = if spec.name.trim().is_empty() {
            format!("task-{}", submit_seq)
        } else {
            spec.name
        };

        Ok(Self {
            id,
            metadata: TaskMetadata {
                name,
                created_at: Utc::now(),
            },
            payload: spec.payload,
            priority,
            resources,
            status: TaskStatus::Queued,
            assigned_worker: None,
            progress: 0,
            stdout: String::new(),
            stderr: String::new(),
            error_reason: None,
            started_at: None,
            finished_at: None,
            submit_seq,
            dispatch_count: 0,
            unschedulable: false,
        })
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time between the first running report and the terminal one.
    pub fn execution_time(&self) -> Option<std::time::Duration> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        (finished - started).to_std().ok()
    }

    /// Reset execution state so the task can be dispatched again.
    ///
    /// Priority, metadata and `submit_seq` are preserved.
    pub fn reset_to_queued(&mut self, reason: Option<String>) {
        self.status = TaskStatus::Queued;
        self.assigned_worker = None;
        self.progress = 0;
        self.stdout.clear();
        self.stderr.clear();
        self.started_at = None;
        self.finished_at = None;
        self.unschedulable = false;
        self.error_reason = reason;
    }
}
