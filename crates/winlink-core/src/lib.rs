//! WinLink Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/TLS
//! - Storage
//! - Runtime specifics
//!
//! All types here represent the task-dispatch domain shared by the master
//! and its workers.

pub mod error;
pub mod event;
pub mod ids;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use error::TaskError;
pub use event::{TaskEvent, TaskEventKind};
pub use ids::{validate_worker_id_format, TaskId, WorkerId};
pub use status::{ConnectionState, TaskStatus};
pub use task::{Payload, Priority, ResourceLimits, Task, TaskMetadata, TaskSpec, TaskUpdate};
pub use worker::{ResourceUsage, WorkerCapacity, WorkerInfo};
