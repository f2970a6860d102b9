//! Worker-side message loop.
//!
//! Runs inside a tokio task (thread transport) or a child process (stdio
//! transport). Kernels execute on the blocking pool so the loop keeps
//! answering pings while a task is computing.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{ComputeTask, HostMessage, WorkerMessage};
use super::{DegradeLevel, WorkerCapabilities};
use crate::error::EngineError;
use crate::kernel;

pub struct WorkerRuntime {
    capabilities: WorkerCapabilities,
    paused: bool,
    held: VecDeque<ComputeTask>,
}

impl WorkerRuntime {
    pub fn new(capabilities: WorkerCapabilities) -> Self {
        Self {
            capabilities,
            paused: false,
            held: VecDeque::new(),
        }
    }

    /// Announce readiness, then serve `inbound` until `shutdown` or until
    /// either side of the link closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<HostMessage>,
        outbound: mpsc::Sender<WorkerMessage>,
    ) {
        let ready = WorkerMessage::Ready {
            capabilities: self.capabilities,
        };
        if outbound.send(ready).await.is_err() {
            return;
        }

        while let Some(msg) = inbound.recv().await {
            match msg {
                HostMessage::ComputeTask(task) => {
                    if self.paused {
                        debug!(task = %task.id, "worker paused, holding task");
                        self.held.push_back(task);
                    } else {
                        spawn_compute(task, outbound.clone());
                    }
                }
                HostMessage::Ping { seq } => {
                    if outbound.send(WorkerMessage::Pong { seq }).await.is_err() {
                        break;
                    }
                }
                HostMessage::Pause => {
                    self.paused = true;
                }
                HostMessage::Resume => {
                    self.paused = false;
                    for task in self.held.drain(..) {
                        spawn_compute(task, outbound.clone());
                    }
                }
                HostMessage::Shutdown => {
                    info!(held = self.held.len(), "worker received shutdown");
                    break;
                }
            }
        }
    }
}

fn spawn_compute(task: ComputeTask, outbound: mpsc::Sender<WorkerMessage>) {
    tokio::spawn(async move {
        let id = task.id;
        let result = kernel::execute_blocking(task.operation, task.params, task.payload).await;
        let reply = match result {
            Ok(data) => vec![WorkerMessage::TaskResult { id, data }],
            Err(e @ EngineError::TaskExecutionError { .. }) => {
                warn!(task = %id, error = %e, "kernel aborted, reporting degradation");
                vec![
                    WorkerMessage::TaskError {
                        id,
                        error: e.to_string(),
                    },
                    WorkerMessage::Degraded {
                        level: DegradeLevel::Major,
                        error: e.to_string(),
                    },
                ]
            }
            Err(e) => vec![WorkerMessage::TaskError {
                id,
                error: e.to_string(),
            }],
        };
        for msg in reply {
            if outbound.send(msg).await.is_err() {
                debug!(task = %id, "host link closed before result was delivered");
                break;
            }
        }
    });
}
