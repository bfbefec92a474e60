//! Wire message schemas.
//!
//! Messages are JSON objects tagged by a `type` field. They travel inside an
//! [`Envelope`](crate::Envelope) as the signed `body`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use winlink_core::{
    Payload, Priority, ResourceLimits, ResourceUsage, TaskId, TaskStatus, WorkerCapacity,
    WorkerId,
};

/// Kinds of message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Register,
    TaskSubmit,
    TaskUpdate,
    Heartbeat,
    Cancel,
    Ack,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::TaskSubmit => "task_submit",
            MessageKind::TaskUpdate => "task_update",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Cancel => "cancel",
            MessageKind::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Register(Register),
    TaskSubmit(TaskSubmit),
    TaskUpdate(TaskUpdateMsg),
    Heartbeat(Heartbeat),
    Cancel(Cancel),
    Ack(Ack),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Register(_) => MessageKind::Register,
            Message::TaskSubmit(_) => MessageKind::TaskSubmit,
            Message::TaskUpdate(_) => MessageKind::TaskUpdate,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::Cancel(_) => MessageKind::Cancel,
            Message::Ack(_) => MessageKind::Ack,
        }
    }
}

/// First message on every connection, sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub capacity: WorkerCapacity,
    /// Tasks the worker is still executing (non-empty after a reconnect).
    #[serde(default)]
    pub active_tasks: Vec<TaskId>,
}

/// Task metadata carried by `task_submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitMetadata {
    pub name: String,
}

/// Master → worker: run this task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmit {
    pub task_id: TaskId,
    pub metadata: SubmitMetadata,
    pub payload: Payload,
    pub resources: ResourceLimits,
    pub priority: Priority,
}

/// Worker → master: status, progress and output deltas for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdateMsg {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub stdout_delta: String,
    #[serde(default)]
    pub stderr_delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

/// Worker → master liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub load: u32,
    pub capacity: WorkerCapacity,
    /// Host usage sample; absent when the worker does not report usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
}

/// Master → worker: stop this task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub task_id: TaskId,
    pub reason: String,
}

/// Outcome of a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ref_kind: MessageKind,
    pub ref_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Ack {
    pub fn ok(ref_kind: MessageKind, ref_id: impl Into<String>) -> Self {
        Self {
            ref_kind,
            ref_id: ref_id.into(),
            ok: true,
            detail: None,
        }
    }

    pub fn rejected(
        ref_kind: MessageKind,
        ref_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ref_kind,
            ref_id: ref_id.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn round_trip(msg: Message) {
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg, "{json}");
    }

    fn capacity() -> WorkerCapacity {
        WorkerCapacity::new(80, 2048, 4)
    }

    #[test]
    fn test_register_round_trip() {
        let mut register = Register {
            worker_id: WorkerId::new("w1"),
            hostname: "host".into(),
            address: "10.0.0.2:0".into(),
            version: "0.1.0".into(),
            capacity: capacity(),
            active_tasks: vec![],
        };
        round_trip(Message::Register(register.clone()));

        register.active_tasks = vec![TaskId::new("t1"), TaskId::new("t2")];
        round_trip(Message::Register(register));
    }

    #[test]
    fn test_register_without_active_tasks_field() {
        let json = r#"{"type":"register","worker_id":"w1","hostname":"h","address":"",
            "version":"1","capacity":{"cpu_percent":50,"memory_mb":512,"max_tasks":1}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        match msg {
            Message::Register(r) => assert!(r.active_tasks.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_task_submit_round_trip() {
        let mut params = BTreeMap::new();
        params.insert("n".to_string(), "10".to_string());
        for payload in [
            Payload::code("python", "print(1)"),
            Payload::template("hello_world"),
            Payload::Template {
                name: "fibonacci".into(),
                params,
            },
        ] {
            round_trip(Message::TaskSubmit(TaskSubmit {
                task_id: TaskId::new("t1"),
                metadata: SubmitMetadata {
                    name: "job".into(),
                },
                payload,
                resources: ResourceLimits::new(10, 64, 5),
                priority: Priority::Critical,
            }));
        }
    }

    #[test]
    fn test_task_update_round_trip() {
        let mut update = TaskUpdateMsg {
            task_id: TaskId::new("t1"),
            status: TaskStatus::Running,
            progress: 0,
            stdout_delta: String::new(),
            stderr_delta: String::new(),
            error_reason: None,
        };
        round_trip(Message::TaskUpdate(update.clone()));

        let json = serde_json::to_string(&Message::TaskUpdate(update.clone())).unwrap();
        assert!(!json.contains("error_reason"));

        update.status = TaskStatus::Failed;
        update.progress = 100;
        update.stdout_delta = "out\n".into();
        update.stderr_delta = "err\n".into();
        update.error_reason = Some("exit code 1".into());
        round_trip(Message::TaskUpdate(update));
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::TaskUpdate(TaskUpdateMsg {
            task_id: TaskId::new("t9"),
            status: TaskStatus::TimedOut,
            progress: 42,
            stdout_delta: String::new(),
            stderr_delta: String::new(),
            error_reason: Some("deadline".into()),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "task_update");
        assert_eq!(value["status"], "TIMED_OUT");
        assert_eq!(value["task_id"], "t9");
    }

    #[test]
    fn test_heartbeat_usage_is_optional() {
        let json = r#"{"type":"heartbeat","worker_id":"w1","timestamp":"2026-01-01T00:00:00Z","load":1,"capacity":{"cpu_percent":100,"memory_mb":1024,"max_concurrent":2}}"#;
        match serde_json::from_str::<Message>(json).unwrap() {
            Message::Heartbeat(beat) => assert!(beat.usage.is_none()),
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_cancel_ack_round_trip() {
        round_trip(Message::Heartbeat(Heartbeat {
            worker_id: WorkerId::new("w1"),
            timestamp: Utc::now(),
            load: 3,
            capacity: capacity(),
            usage: Some(ResourceUsage {
                cpu_percent: 12.5,
                memory_percent: 40.0,
                memory_available_mb: 2048,
                disk_percent: 71.25,
                disk_free_mb: 10_000,
                active_tasks: 3,
            }),
        }));
        round_trip(Message::Cancel(Cancel {
            task_id: TaskId::new("t1"),
            reason: String::new(),
        }));
        round_trip(Message::Ack(Ack::ok(MessageKind::Heartbeat, "w1")));
        round_trip(Message::Ack(Ack::rejected(
            MessageKind::Register,
            "w1",
            "certificate mismatch",
        )));
    }

    #[test]
    fn test_message_kind_matches_tag() {
        let msg = Message::Ack(Ack::ok(MessageKind::Register, "w1"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind().as_str());
        assert_eq!(value["ref_kind"], "register");
    }
}
