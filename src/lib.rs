//! offloadengine -- compute offload with a worker pool, an accelerator
//! gateway and tiered fallback.
//!
//! Submissions try the accelerator first, then a pool of workers (chunked
//! across several workers for large payloads), then software kernels on the
//! host. A lifecycle coordinator pauses and tears the engine down in
//! priority order.

pub mod accel;
pub mod api;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod lifecycle;
pub mod metrics;
pub mod notice;
pub mod probe;
pub mod worker;

pub use engine::{EngineBuilder, OffloadEngine};
pub use error::{EngineError, EngineResult};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::lifecycle::HostSignal;
use crate::notice::EngineNotice;

const NOTICE_CAPACITY: usize = 64;

/// Start the engine and its status API; Ctrl-C unloads the engine.
pub async fn serve(bind: &str, config: EngineConfig) -> Result<()> {
    // 1. Build and initialize the engine
    let (tx, rx) = mpsc::channel(NOTICE_CAPACITY);
    tokio::spawn(log_notices(rx));
    let engine = OffloadEngine::builder(config).notices(tx).build()?;
    let init = engine.initialize().await?;
    tracing::info!(
        accelerator_ready = init.accelerator_ready,
        workers = init.workers,
        "Engine ready"
    );

    // 2. Start API Server
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", bind))?;
    let app = api::router(api::state::AppState {
        engine: engine.clone(),
    });

    tracing::info!(%addr, "offloadengine listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(unload_on_ctrl_c(engine))
        .await?;

    Ok(())
}

async fn unload_on_ctrl_c(engine: OffloadEngine) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        return;
    }
    tracing::info!("Ctrl-C received, unloading engine");
    engine.handle_signal(HostSignal::Unload).await;
}

/// Log every notice until the engine drops its sender.
pub async fn log_notices(mut rx: mpsc::Receiver<EngineNotice>) {
    while let Some(notice) = rx.recv().await {
        match &notice {
            EngineNotice::WorkerEvicted { worker, reason } => {
                tracing::warn!(worker, %reason, "worker evicted")
            }
            EngineNotice::PoolDegraded {
                degraded,
                total,
                max_in_flight,
            } => tracing::warn!(degraded, total, max_in_flight, "pool degraded"),
            other => tracing::info!(notice = ?other, "engine notice"),
        }
    }
}
