//! Engine facade.
//!
//! [`EngineBuilder`] constructs the pool, gateway, distributor and lifecycle
//! coordinator once and wires the components' cleanup and suspend hooks into
//! the coordinator. [`OffloadEngine`] is a cheap `Clone` handle over them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::accel::{self, AcceleratorDevice, AcceleratorGateway, AcceleratorState, DeviceLimits};
use crate::config::{EngineConfig, WorkerTransport};
use crate::distributor::{ComputeOutcome, TaskDistributor};
use crate::error::{EngineError, EngineResult};
use crate::kernel::{ComputeParams, OperationKind};
use crate::lifecycle::{CleanupHandle, HostSignal, LifecycleCoordinator, LifecycleState, PhaseReport};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::notice::{EngineNotice, NoticeSink};
use crate::worker::pool::WorkerSummary;
use crate::worker::{ProcessSpawner, ThreadSpawner, WorkerPool, WorkerSpawner};

/// Cleanup priorities of the built-in hooks. Caller hooks above 300 run
/// while the engine still accepts work.
pub const PRIORITY_INTAKE: i32 = 300;
pub const PRIORITY_POOL: i32 = 200;
pub const PRIORITY_ACCELERATOR: i32 = 100;
pub const PRIORITY_METRICS: i32 = 10;

/// What `initialize` managed to bring up.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub accelerator_ready: bool,
    pub workers: usize,
}

pub struct EngineBuilder {
    config: EngineConfig,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    device: Option<Arc<dyn AcceleratorDevice>>,
    notices: NoticeSink,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            spawner: None,
            device: None,
            notices: NoticeSink::disabled(),
        }
    }

    /// Override the worker transport chosen by `pool.transport`.
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Override the device chosen by `accelerator.backend`.
    pub fn device(mut self, device: Arc<dyn AcceleratorDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Channel for coordination notices. Full channels drop notices.
    pub fn notices(mut self, tx: mpsc::Sender<EngineNotice>) -> Self {
        self.notices = NoticeSink::new(tx);
        self
    }

    pub fn build(self) -> EngineResult<OffloadEngine> {
        let config = self.config;

        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => default_spawner(&config)?,
        };
        let device = self
            .device
            .unwrap_or_else(|| accel::device_for(config.accelerator.backend));
        info!(
            spawner = spawner.name(),
            device = device.name(),
            target_workers = config.pool.target_size,
            "building offload engine"
        );

        let metrics = Arc::new(Metrics::new());
        let pool = WorkerPool::new(config.pool.clone(), spawner, self.notices.clone());
        let gateway = AcceleratorGateway::new(device, config.accelerator.compute_timeout());
        let distributor = TaskDistributor::new(
            pool.clone(),
            gateway.clone(),
            config.distributor.clone(),
            config.pool.task_timeout(),
            metrics.clone(),
        );
        let lifecycle = LifecycleCoordinator::new(config.lifecycle.clone(), self.notices.clone());

        let engine = OffloadEngine {
            inner: Arc::new(EngineInner {
                config,
                pool,
                gateway,
                distributor,
                lifecycle,
                metrics,
                notices: self.notices,
                accepting: Arc::new(AtomicBool::new(true)),
                started: Instant::now(),
                init: OnceCell::new(),
            }),
        };
        engine.register_builtin_hooks();
        Ok(engine)
    }
}

pub(crate) fn default_spawner(config: &EngineConfig) -> EngineResult<Arc<dyn WorkerSpawner>> {
    match config.pool.transport {
        WorkerTransport::Thread => Ok(Arc::new(ThreadSpawner::new())),
        WorkerTransport::Process => {
            let spawner = match &config.pool.worker_program {
                Some(program) => ProcessSpawner::new(program),
                None => ProcessSpawner::current_exe().map_err(|e| {
                    EngineError::InitializationFailure {
                        reason: format!("{:#}", e),
                    }
                })?,
            };
            Ok(Arc::new(spawner))
        }
    }
}

#[derive(Clone)]
pub struct OffloadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    pool: WorkerPool,
    gateway: AcceleratorGateway,
    distributor: TaskDistributor,
    lifecycle: LifecycleCoordinator,
    metrics: Arc<Metrics>,
    notices: NoticeSink,
    accepting: Arc<AtomicBool>,
    started: Instant,
    init: OnceCell<InitReport>,
}

impl OffloadEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn register_builtin_hooks(&self) {
        let lifecycle = &self.inner.lifecycle;

        let accepting = self.inner.accepting.clone();
        lifecycle.register_cleanup("intake", PRIORITY_INTAKE, move || {
            let accepting = accepting.clone();
            async move {
                accepting.store(false, Ordering::Release);
                debug!("intake closed");
                Ok(())
            }
        });

        let pool = self.inner.pool.clone();
        lifecycle.register_cleanup("worker-pool", PRIORITY_POOL, move || {
            let pool = pool.clone();
            async move {
                pool.shutdown().await;
                Ok(())
            }
        });

        let gateway = self.inner.gateway.clone();
        lifecycle.register_cleanup("accelerator", PRIORITY_ACCELERATOR, move || {
            let gateway = gateway.clone();
            async move {
                gateway.release().await;
                Ok(())
            }
        });

        let metrics = self.inner.metrics.clone();
        let pool = self.inner.pool.clone();
        let gateway = self.inner.gateway.clone();
        lifecycle.register_cleanup("metrics", PRIORITY_METRICS, move || {
            let metrics = metrics.clone();
            let pool = pool.clone();
            let gateway = gateway.clone();
            async move {
                let snap = metrics.snapshot(pool.status().await, gateway.state());
                info!(
                    completed = snap.completed,
                    errors = snap.error_count,
                    accelerator = snap.tiers.accelerator,
                    worker = snap.tiers.worker,
                    software = snap.tiers.software,
                    avg_latency_ms = snap.avg_latency_ms,
                    "final engine metrics"
                );
                Ok(())
            }
        });

        let pause_pool = self.inner.pool.clone();
        let resume_pool = self.inner.pool.clone();
        lifecycle.register_suspend(
            "worker-pool",
            PRIORITY_POOL,
            move || {
                let pool = pause_pool.clone();
                async move {
                    pool.pause().await;
                    Ok(())
                }
            },
            move || {
                let pool = resume_pool.clone();
                async move {
                    pool.resume().await;
                    Ok(())
                }
            },
        );
    }

    /// Bring up the accelerator and the worker pool. Memoized; later calls
    /// return the first report. Neither tier failing is fatal.
    pub async fn initialize(&self) -> EngineResult<InitReport> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        let report = self
            .inner
            .init
            .get_or_init(|| async {
                self.forward_accelerator_state();
                let (accelerator_ready, workers) =
                    tokio::join!(self.inner.gateway.initialize(), self.inner.pool.initialize());
                let workers = match workers {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "worker pool unavailable, software fallback only");
                        0
                    }
                };
                info!(accelerator_ready, workers, "offload engine initialized");
                InitReport {
                    accelerator_ready,
                    workers,
                }
            })
            .await;
        Ok(report.clone())
    }

    fn forward_accelerator_state(&self) {
        let mut rx = self.inner.gateway.subscribe();
        let notices = self.inner.notices.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                notices.emit(EngineNotice::AcceleratorStateChanged { state });
            }
        });
    }

    /// Run `op` over `buffer`. `elapsed_time` defaults to seconds since the
    /// engine was built.
    pub async fn submit_compute(
        &self,
        buffer: Vec<f32>,
        op: OperationKind,
        elapsed_time: Option<f64>,
    ) -> EngineResult<Vec<f32>> {
        let elapsed = elapsed_time.unwrap_or_else(|| self.uptime().as_secs_f64());
        self.submit(op, buffer, ComputeParams::new(elapsed, 0))
            .await
            .map(|outcome| outcome.data)
    }

    /// Like [`submit_compute`](Self::submit_compute) with explicit parameters,
    /// returning which tier served the request.
    pub async fn submit(
        &self,
        op: OperationKind,
        buffer: Vec<f32>,
        params: ComputeParams,
    ) -> EngineResult<ComputeOutcome> {
        self.initialize().await?;
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }

        self.inner.metrics.record_submit();
        let units = buffer.len() / op.record_width();
        let start = Instant::now();
        match self.inner.distributor.submit(op, buffer, params).await {
            Ok(outcome) => {
                self.inner
                    .metrics
                    .record_success(outcome.tier, units, start.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                self.inner.metrics.record_error();
                debug!(%op, error = %e, "submission failed");
                Err(e)
            }
        }
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.pool.status().await, self.inner.gateway.state())
    }

    /// Register a cleanup hook that runs during shutdown by descending priority.
    pub fn register_cleanup<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: i32,
        callback: F,
    ) -> CleanupHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.lifecycle.register_cleanup(name, priority, callback)
    }

    pub async fn shutdown(&self) -> PhaseReport {
        self.inner.lifecycle.shutdown().await
    }

    pub async fn pause(&self) {
        self.inner.lifecycle.pause().await
    }

    pub async fn resume(&self) {
        self.inner.lifecycle.resume().await
    }

    pub async fn handle_signal(&self, signal: HostSignal) {
        self.inner.lifecycle.handle_signal(signal).await
    }

    pub fn subscribe_accelerator(&self) -> watch::Receiver<AcceleratorState> {
        self.inner.gateway.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.inner.lifecycle.subscribe()
    }

    /// Retry accelerator acquisition after a failure.
    pub async fn reprobe_accelerator(&self) -> bool {
        self.inner.gateway.reprobe().await
    }

    pub fn accelerator_state(&self) -> AcceleratorState {
        self.inner.gateway.state()
    }

    pub async fn accelerator_limits(&self) -> Option<DeviceLimits> {
        self.inner.gateway.limits().await
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub async fn workers(&self) -> Vec<WorkerSummary> {
        self.inner.pool.workers().await
    }

    /// Time since the engine was built; the default kernel clock.
    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
            && !matches!(
                self.inner.lifecycle.state(),
                LifecycleState::ShuttingDown | LifecycleState::Shutdown
            )
    }
}
