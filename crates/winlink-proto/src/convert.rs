//! Converters between wire messages and domain types.

use winlink_core::{Task, TaskId, TaskUpdate, WorkerInfo};

use crate::message::{Register, SubmitMetadata, TaskSubmit, TaskUpdateMsg};

impl From<&Task> for TaskSubmit {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            metadata: SubmitMetadata {
                name: task.metadata.name.clone(),
            },
            payload: task.payload.clone(),
            resources: task.resources,
            priority: task.priority,
        }
    }
}

impl TaskUpdateMsg {
    pub fn new(task_id: TaskId, update: TaskUpdate) -> Self {
        Self {
            task_id,
            status: update.status,
            progress: update.progress,
            stdout_delta: update.stdout_delta,
            stderr_delta: update.stderr_delta,
            error_reason: update.error_reason,
        }
    }

    /// Split into the task id and the domain-level update.
    pub fn into_parts(self) -> (TaskId, TaskUpdate) {
        (
            self.task_id,
            TaskUpdate {
                status: self.status,
                progress: self.progress,
                stdout_delta: self.stdout_delta,
                stderr_delta: self.stderr_delta,
                error_reason: self.error_reason,
            },
        )
    }
}

impl Register {
    pub fn new(info: &WorkerInfo, active_tasks: Vec<TaskId>) -> Self {
        Self {
            worker_id: info.worker_id.clone(),
            hostname: info.hostname.clone(),
            address: info.address.clone(),
            version: info.version.clone(),
            capacity: info.capacity,
            active_tasks,
        }
    }
}

impl From<&Register> for WorkerInfo {
    fn from(register: &Register) -> Self {
        Self {
            worker_id: register.worker_id.clone(),
            hostname: register.hostname.clone(),
            address: register.address.clone(),
            version: register.version.clone(),
            capacity: register.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winlink_core::{Payload, Priority, ResourceLimits, TaskSpec, TaskStatus, WorkerCapacity, WorkerId};

    #[test]
    fn test_task_to_submit() {
        let spec = TaskSpec::new("job", Payload::code("sh", "echo hi"))
            .with_priority(Priority::High)
            .with_resources(ResourceLimits::new(10, 64, 5));
        let task = Task::from_spec(TaskId::new("t1"), spec, 1).unwrap();

        let submit = TaskSubmit::from(&task);
        assert_eq!(submit.task_id, task.id);
        assert_eq!(submit.metadata.name, "job");
        assert_eq!(submit.priority, Priority::High);
        assert_eq!(submit.resources, task.resources);
    }

    #[test]
    fn test_update_parts() {
        let update = TaskUpdate::new(TaskStatus::Running)
            .with_progress(30)
            .with_output("a", "b");
        let msg = TaskUpdateMsg::new(TaskId::new("t1"), update.clone());
        let (id, back) = msg.into_parts();
        assert_eq!(id.as_str(), "t1");
        assert_eq!(back, update);
    }

    #[test]
    fn test_register_info_round_trip() {
        let info = WorkerInfo::new(WorkerId::new("w1"), "host")
            .with_address("10.0.0.5:0")
            .with_capacity(WorkerCapacity::new(50, 1024, 2));
        let register = Register::new(&info, vec![]);
        assert_eq!(WorkerInfo::from(&register), info);
    }
}
