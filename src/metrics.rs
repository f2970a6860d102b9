//! Engine counters behind `get_metrics()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::accel::{AcceleratorState, Tier};
use crate::worker::PoolStatus;

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    submitted: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    units: AtomicU64,
    latency_us: AtomicU64,
    accelerator: AtomicU64,
    worker: AtomicU64,
    software: AtomicU64,
    chunked_jobs: AtomicU64,
    chunk_fallbacks: AtomicU64,
    bounds_violations: AtomicU64,
    malformed_chunks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            units: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            accelerator: AtomicU64::new(0),
            worker: AtomicU64::new(0),
            software: AtomicU64::new(0),
            chunked_jobs: AtomicU64::new(0),
            chunk_fallbacks: AtomicU64::new(0),
            bounds_violations: AtomicU64::new(0),
            malformed_chunks: AtomicU64::new(0),
        }
    }

    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, tier: Tier, units: usize, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.units.fetch_add(units as u64, Ordering::Relaxed);
        self.latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let counter = match tier {
            Tier::Accelerator => &self.accelerator,
            Tier::Worker => &self.worker,
            Tier::Software => &self.software,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunked(&self, fallbacks: usize, truncated: usize, skipped: usize) {
        self.chunked_jobs.fetch_add(1, Ordering::Relaxed);
        self.chunk_fallbacks
            .fetch_add(fallbacks as u64, Ordering::Relaxed);
        self.bounds_violations
            .fetch_add(truncated as u64, Ordering::Relaxed);
        self.malformed_chunks
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pool: PoolStatus, accelerator_state: AcceleratorState) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let uptime = self.started.elapsed().as_secs_f64();
        let avg_latency_ms = if completed == 0 {
            0.0
        } else {
            self.latency_us.load(Ordering::Relaxed) as f64 / completed as f64 / 1000.0
        };
        let per_sec = |n: u64| if uptime > 0.0 { n as f64 / uptime } else { 0.0 };

        MetricsSnapshot {
            active_workers: pool.active_workers,
            queue_depth: pool.queue_depth,
            throughput: per_sec(completed),
            units_per_second: per_sec(self.units.load(Ordering::Relaxed)),
            avg_latency_ms,
            error_count: self.errors.load(Ordering::Relaxed),
            accelerator_state,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            tiers: TierCounters {
                accelerator: self.accelerator.load(Ordering::Relaxed),
                worker: self.worker.load(Ordering::Relaxed),
                software: self.software.load(Ordering::Relaxed),
            },
            chunked_jobs: self.chunked_jobs.load(Ordering::Relaxed),
            chunk_fallbacks: self.chunk_fallbacks.load(Ordering::Relaxed),
            bounds_violations: self.bounds_violations.load(Ordering::Relaxed),
            malformed_chunks: self.malformed_chunks.load(Ordering::Relaxed),
            uptime_secs: uptime,
            pool,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierCounters {
    pub accelerator: u64,
    pub worker: u64,
    pub software: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_workers: usize,
    pub queue_depth: usize,
    /// Completed submissions per second since engine start.
    pub throughput: f64,
    pub units_per_second: f64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub accelerator_state: AcceleratorState,
    pub submitted: u64,
    pub completed: u64,
    pub tiers: TierCounters,
    pub chunked_jobs: u64,
    pub chunk_fallbacks: u64,
    pub bounds_violations: u64,
    pub malformed_chunks: u64,
    pub uptime_secs: f64,
    pub pool: PoolStatus,
}
