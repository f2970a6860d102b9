//! Coordination notices pushed to the embedding application.
//!
//! The application hands the engine an already-initialized channel; the
//! engine never blocks on it.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::accel::AcceleratorState;
use crate::lifecycle::LifecycleState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotice {
    AcceleratorStateChanged { state: AcceleratorState },
    WorkerEvicted { worker: u64, reason: String },
    PoolDegraded {
        degraded: usize,
        total: usize,
        max_in_flight: usize,
    },
    LifecycleChanged { state: LifecycleState },
}

/// Non-blocking sender for [`EngineNotice`]. A full channel drops the notice.
#[derive(Debug, Clone, Default)]
pub struct NoticeSink {
    tx: Option<mpsc::Sender<EngineNotice>>,
}

impl NoticeSink {
    pub fn new(tx: mpsc::Sender<EngineNotice>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, notice: EngineNotice) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(notice)) => {
                warn!(?notice, "notice channel full, dropping notice");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("notice channel closed");
            }
        }
    }
}
