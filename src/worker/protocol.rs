//! Host <-> worker messages.
//!
//! Both directions are internally tagged JSON objects (`{"type": "ping", ...}`)
//! so the same definitions serve the in-process and the stdio transports.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DegradeLevel, WorkerCapabilities};
use crate::kernel::{ComputeParams, OperationKind};

pub type TaskId = Uuid;

/// One unit of work. Immutable once built; consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTask {
    pub id: TaskId,
    pub operation: OperationKind,
    pub payload: Vec<f32>,
    pub params: ComputeParams,
    #[serde(default)]
    pub priority: i32,
}

impl ComputeTask {
    pub fn new(operation: OperationKind, payload: Vec<f32>, params: ComputeParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            payload,
            params,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Messages sent by the pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    ComputeTask(ComputeTask),
    Ping { seq: u64 },
    Pause,
    Resume,
    Shutdown,
}

/// Messages sent by a worker to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { capabilities: WorkerCapabilities },
    TaskResult { id: TaskId, data: Vec<f32> },
    TaskError { id: TaskId, error: String },
    Degraded { level: DegradeLevel, error: String },
    Pong { seq: u64 },
    /// Unsolicited failure; the pool evicts the sender.
    Fault { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(HostMessage::Ping { seq: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping", "seq": 7}));

        let json = serde_json::to_value(HostMessage::Pause).unwrap();
        assert_eq!(json, serde_json::json!({"type": "pause"}));

        let task = ComputeTask::new(
            OperationKind::Transform,
            vec![1.0, 2.0, 3.0, 1.0],
            ComputeParams::new(0.5, 0),
        );
        let json = serde_json::to_value(HostMessage::ComputeTask(task.clone())).unwrap();
        assert_eq!(json["type"], "compute_task");
        assert_eq!(json["operation"], "transform");
        assert_eq!(json["id"], task.id.to_string());
    }

    #[test]
    fn test_parse_worker_messages() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"degraded","level":"severe","error":"simd path lost"}"#)
                .unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Degraded {
                level: DegradeLevel::Severe,
                error: "simd path lost".into()
            }
        );

        let msg: WorkerMessage = serde_json::from_str(
            r#"{"type":"ready","capabilities":{"accelerated_path":true,"secondary_path":false,"performance_score":1.2}}"#,
        )
        .unwrap();
        assert!(matches!(msg, WorkerMessage::Ready { capabilities } if capabilities.accelerated_path));
    }

    #[test]
    fn test_priority_defaults_to_zero() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"id":"{}","operation":"inference","payload":[],"params":{{"elapsed_time":0.0,"mode":0}}}}"#,
            id
        );
        let task: ComputeTask = serde_json::from_str(&raw).unwrap();
        assert_eq!(task.priority, 0);
        assert_eq!(task.params.unit_offset, 0);
    }
}
