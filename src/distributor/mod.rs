//! Task distributor -- tier selection, chunked dispatch, per-chunk fallback.
//!
//! Small payloads go to one tier at a time (accelerator, then one worker,
//! then software). Payloads at or above the chunk threshold are split across
//! the pool when more than one non-degraded worker is ready; each chunk degrades on its own
//! and the results are reassembled by offset.

pub mod chunking;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use self::chunking::{plan_chunks, reassemble, ChunkSpec};
use crate::accel::{AcceleratorGateway, Tier};
use crate::config::DistributorConfig;
use crate::error::{EngineError, EngineResult};
use crate::kernel::{self, fallback, ComputeParams, OperationKind};
use crate::metrics::Metrics;
use crate::worker::protocol::ComputeTask;
use crate::worker::WorkerPool;

/// Result of one submission.
#[derive(Debug, Clone, Serialize)]
pub struct ComputeOutcome {
    pub data: Vec<f32>,
    /// Tier that produced the result. For chunked jobs: `Worker` unless
    /// every chunk fell back to software.
    pub tier: Tier,
    pub chunks: usize,
    pub fallback_chunks: usize,
}

#[derive(Clone)]
pub struct TaskDistributor {
    pool: WorkerPool,
    gateway: AcceleratorGateway,
    config: DistributorConfig,
    task_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl TaskDistributor {
    pub fn new(
        pool: WorkerPool,
        gateway: AcceleratorGateway,
        config: DistributorConfig,
        task_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            gateway,
            config,
            task_timeout,
            metrics,
        }
    }

    pub async fn submit(
        &self,
        op: OperationKind,
        data: Vec<f32>,
        params: ComputeParams,
    ) -> EngineResult<ComputeOutcome> {
        let units = kernel::unit_count(op, &data)?;
        let ready = self.pool.ready_workers().await;

        if units >= self.config.chunk_threshold_units && ready > 1 {
            self.submit_chunked(op, data, params, units, ready).await
        } else {
            self.submit_single(op, data, params).await
        }
    }

    async fn submit_single(
        &self,
        op: OperationKind,
        data: Vec<f32>,
        params: ComputeParams,
    ) -> EngineResult<ComputeOutcome> {
        let lower = OnceLock::new();
        let out = if self.gateway.is_available() {
            self.gateway
                .compute(op, params, data, |data| {
                    self.below_accelerator(op, params, data, &lower)
                })
                .await?
        } else {
            self.below_accelerator(op, params, data, &lower).await?
        };

        let tier = lower.get().copied().unwrap_or(Tier::Accelerator);
        debug!(%op, %tier, "single-shot dispatch resolved");
        Ok(ComputeOutcome {
            data: out,
            tier,
            chunks: 1,
            fallback_chunks: usize::from(tier == Tier::Software),
        })
    }

    async fn below_accelerator(
        &self,
        op: OperationKind,
        params: ComputeParams,
        data: Vec<f32>,
        tier: &OnceLock<Tier>,
    ) -> EngineResult<Vec<f32>> {
        let (out, used) = self.worker_or_software(op, params, data).await?;
        let _ = tier.set(used);
        Ok(out)
    }

    async fn worker_or_software(
        &self,
        op: OperationKind,
        params: ComputeParams,
        data: Vec<f32>,
    ) -> EngineResult<(Vec<f32>, Tier)> {
        let expected = data.len();
        let task = ComputeTask::new(op, data.clone(), params);
        match self.pool.execute(task, self.task_timeout).await {
            Ok(out) if out.len() == expected => return Ok((out, Tier::Worker)),
            Ok(out) => {
                warn!(expected, got = out.len(), "worker returned malformed buffer, using software")
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(EngineError::PoolExhausted) => debug!("no live workers, using software"),
            Err(e) => warn!(error = %e, "worker tier failed, using software"),
        }
        let out = fallback::approximate_blocking(op, params, data).await?;
        Ok((out, Tier::Software))
    }

    async fn submit_chunked(
        &self,
        op: OperationKind,
        data: Vec<f32>,
        params: ComputeParams,
        units: usize,
        ready: usize,
    ) -> EngineResult<ComputeOutcome> {
        let cap = self
            .gateway
            .limits()
            .await
            .and_then(|limits| limits.max_units(op))
            .unwrap_or(self.config.max_chunk_units);
        let count = self.config.max_parallel_chunks.min(ready);
        let plan = plan_chunks(units, count, cap);
        let width = op.record_width();
        info!(%op, units, ready, chunks = plan.len(), max_chunk_units = cap, "chunked dispatch");

        let mut running: FuturesUnordered<_> = plan
            .iter()
            .map(|spec| {
                let spec = *spec;
                let slice = data[spec.values(width)].to_vec();
                let chunk_params = params.at_offset(spec.unit_offset);
                async move { (spec, self.run_chunk(op, chunk_params, slice, spec).await) }
            })
            .collect();

        let mut results = Vec::with_capacity(plan.len());
        let mut fallback_chunks = 0;
        while let Some((spec, result)) = running.next().await {
            let (out, tier) = result?;
            if tier == Tier::Software {
                fallback_chunks += 1;
            }
            results.push((spec, out));
        }
        drop(running);

        let assembled = reassemble(&data, op, results);
        self.metrics
            .record_chunked(fallback_chunks, assembled.truncated, assembled.skipped);

        let tier = if fallback_chunks == plan.len() {
            Tier::Software
        } else {
            Tier::Worker
        };
        Ok(ComputeOutcome {
            data: assembled.data,
            tier,
            chunks: plan.len(),
            fallback_chunks,
        })
    }

    /// One chunk under its own timeout; failure computes it in software.
    async fn run_chunk(
        &self,
        op: OperationKind,
        params: ComputeParams,
        slice: Vec<f32>,
        spec: ChunkSpec,
    ) -> EngineResult<(Vec<f32>, Tier)> {
        let task = ComputeTask::new(op, slice.clone(), params);
        match self.pool.execute(task, self.task_timeout).await {
            Ok(out) => Ok((out, Tier::Worker)),
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                warn!(chunk = spec.index, units = spec.units, error = %e, "chunk failed, computing in software");
                let out = fallback::approximate_blocking(op, params, slice).await?;
                Ok((out, Tier::Software))
            }
        }
    }
}
