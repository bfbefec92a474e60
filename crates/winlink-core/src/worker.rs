//! Worker information types.

use serde::{Deserialize, Serialize};

use crate::{ResourceLimits, WorkerId};

/// Resources a worker declares when it registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerCapacity {
    /// CPU share available to tasks, in percent.
    pub cpu_percent: u32,

    /// Memory available to tasks, in megabytes.
    pub memory_mb: u64,

    /// Maximum number of concurrently running tasks.
    pub max_tasks: u32,
}

impl WorkerCapacity {
    pub fn new(cpu_percent: u32, memory_mb: u64, max_tasks: u32) -> Self {
        Self {
            cpu_percent,
            memory_mb,
            max_tasks,
        }
    }

    /// Whether a task with these limits could ever run on this worker.
    pub fn fits(&self, limits: &ResourceLimits) -> bool {
        self.max_tasks > 0
            && limits.max_cpu <= self.cpu_percent
            && limits.max_memory_mb <= self.memory_mb
    }
}

impl Default for WorkerCapacity {
    fn default() -> Self {
        Self {
            cpu_percent: 100,
            memory_mb: 2048,
            max_tasks: 5,
        }
    }
}

/// Information a worker reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker identifier.
    pub worker_id: WorkerId,

    /// Hostname of the worker machine.
    pub hostname: String,

    /// Address the worker reports for itself.
    pub address: String,

    /// Worker binary version.
    pub version: String,

    /// Declared capacity.
    pub capacity: WorkerCapacity,
}

impl WorkerInfo {
    /// Create a new WorkerInfo.
    pub fn new(worker_id: WorkerId, hostname: impl Into<String>) -> Self {
        Self {
            worker_id,
            hostname: hostname.into(),
            address: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capacity: WorkerCapacity::default(),
        }
    }

    /// Builder method to set the reported address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Builder method to set the declared capacity.
    pub fn with_capacity(mut self, capacity: WorkerCapacity) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Host usage sampled by a worker and carried on its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_available_mb: u64,
    pub disk_percent: f32,
    pub disk_free_mb: u64,
    /// Tasks running on the worker when the sample was taken.
    pub active_tasks: u32,
}
