use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::{HostMessage, WorkerMessage};
use super::runtime::WorkerRuntime;
use super::{WorkerCapabilities, WorkerId};
use crate::error::EngineResult;

/// Buffer depth of each direction of a worker link.
pub const LINK_CAPACITY: usize = 256;

/// Host end of a worker connection.
pub struct WorkerLink {
    pub tx: mpsc::Sender<HostMessage>,
    pub rx: mpsc::Receiver<WorkerMessage>,
}

impl WorkerLink {
    /// Create a connected pair: the host end, plus the worker's inbound
    /// receiver and outbound sender.
    pub fn pair() -> (
        Self,
        mpsc::Receiver<HostMessage>,
        mpsc::Sender<WorkerMessage>,
    ) {
        let (host_tx, host_rx) = mpsc::channel(LINK_CAPACITY);
        let (worker_tx, worker_rx) = mpsc::channel(LINK_CAPACITY);
        (
            Self {
                tx: host_tx,
                rx: worker_rx,
            },
            host_rx,
            worker_tx,
        )
    }
}

/// Starts workers for the pool.
///
/// `spawn` only has to start the worker; the pool waits for its `ready`
/// message under the spawn timeout.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    fn name(&self) -> &str;

    async fn spawn(&self, id: WorkerId) -> EngineResult<WorkerLink>;
}

/// Runs each worker as a tokio task in this process.
pub struct ThreadSpawner {
    capabilities: WorkerCapabilities,
}

impl ThreadSpawner {
    pub fn new() -> Self {
        Self {
            capabilities: WorkerCapabilities::detect(),
        }
    }

    /// Report fixed capabilities instead of detecting them.
    pub fn with_capabilities(capabilities: WorkerCapabilities) -> Self {
        Self { capabilities }
    }
}

impl Default for ThreadSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    fn name(&self) -> &str {
        "thread"
    }

    async fn spawn(&self, id: WorkerId) -> EngineResult<WorkerLink> {
        let (link, inbound, outbound) = WorkerLink::pair();
        debug!(worker = %id, "starting in-process worker");
        tokio::spawn(WorkerRuntime::new(self.capabilities).run(inbound, outbound));
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_thread_worker_handshake() {
        let caps = WorkerCapabilities {
            accelerated_path: true,
            secondary_path: true,
            performance_score: 2.0,
        };
        let spawner = ThreadSpawner::with_capabilities(caps);
        let mut link = spawner.spawn(WorkerId(1)).await.unwrap();

        assert_eq!(
            link.rx.recv().await,
            Some(WorkerMessage::Ready { capabilities: caps })
        );
        link.tx.send(HostMessage::Ping { seq: 9 }).await.unwrap();
        assert_eq!(link.rx.recv().await, Some(WorkerMessage::Pong { seq: 9 }));
    }
}
