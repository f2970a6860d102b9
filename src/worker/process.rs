//! Child-process worker transport.
//!
//! The host launches `<program> worker` with piped stdio and exchanges
//! length-prefixed JSON frames with it. Worker logs go to stderr, which is
//! inherited so they land next to the host's own output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::runtime::WorkerRuntime;
use super::spawner::{WorkerLink, WorkerSpawner, LINK_CAPACITY};
use super::wire::{HostCodec, WorkerCodec};
use super::{WorkerCapabilities, WorkerId};
use crate::error::{EngineError, EngineResult};

/// How long an exiting child gets before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(1);

pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    /// Launch `program worker` for each worker.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Launch the running executable's `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        Ok(Self::new(exe))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    fn name(&self) -> &str {
        "process"
    }

    async fn spawn(&self, id: WorkerId) -> EngineResult<WorkerLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::InitializationFailure {
                reason: format!("failed to launch {}: {}", self.program.display(), e),
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                return Err(EngineError::InitializationFailure {
                    reason: "worker process has no stdio pipes".to_string(),
                })
            }
        };

        info!(worker = %id, pid = ?child.id(), program = %self.program.display(), "worker process started");

        let (link, mut host_rx, worker_tx) = WorkerLink::pair();

        // host -> child
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, HostCodec::new());
            while let Some(msg) = host_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(worker = %id, error = %e, "worker stdin closed");
                    break;
                }
            }
            // Dropping the sink closes stdin, which ends the child's loop.
        });

        // child -> host; owns the child so it is reaped or killed here
        tokio::spawn(async move {
            let mut stream = FramedRead::new(stdout, HostCodec::new());
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(msg)) => {
                            if worker_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(worker = %id, error = %e, "malformed frame from worker");
                            break;
                        }
                        None => break,
                    },
                    _ = worker_tx.closed() => break,
                }
            }
            drop(stream);

            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(worker = %id, %status, "worker process exited"),
                Ok(Err(e)) => warn!(worker = %id, error = %e, "failed to reap worker process"),
                Err(_) => {
                    warn!(worker = %id, "worker process did not exit, killing");
                    if let Err(e) = child.kill().await {
                        warn!(worker = %id, error = %e, "failed to kill worker process");
                    }
                }
            }
        });

        Ok(link)
    }
}

/// Entry point of the `worker` subcommand: serve the pool over stdin/stdout.
pub async fn run_stdio_worker(capabilities: WorkerCapabilities) -> Result<()> {
    let mut reader = FramedRead::new(tokio::io::stdin(), WorkerCodec::new());
    let mut writer = FramedWrite::new(tokio::io::stdout(), WorkerCodec::new());

    let (host_tx, host_rx) = mpsc::channel(LINK_CAPACITY);
    let (worker_tx, mut worker_rx) = mpsc::channel(LINK_CAPACITY);

    let runtime = tokio::spawn(WorkerRuntime::new(capabilities).run(host_rx, worker_tx));
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = worker_rx.recv().await {
            writer.send(msg).await.context("failed to write frame to host")?;
        }
        Ok::<_, anyhow::Error>(())
    });

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(frame) => {
                    let msg = frame.context("malformed frame from host")?;
                    if host_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("host closed stdin");
                    break;
                }
            },
            _ = host_tx.closed() => break,
        }
    }
    drop(host_tx);

    runtime.await.context("worker runtime panicked")?;
    writer_task.await.context("worker writer panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_fails_spawn() {
        let spawner = ProcessSpawner::new("/nonexistent/offloadengine-worker");
        let err = spawner.spawn(WorkerId(0)).await.err().unwrap();
        assert!(matches!(err, EngineError::InitializationFailure { .. }));
    }
}
