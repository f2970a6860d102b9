//! Worker tier -- protocol, transports, the worker-side runtime and the pool.
//!
//! Workers never share memory with the host; every interaction is a
//! [`protocol::HostMessage`] / [`protocol::WorkerMessage`] exchange over a
//! [`spawner::WorkerLink`].

pub mod pool;
pub mod process;
pub mod protocol;
pub mod runtime;
pub mod spawner;
pub mod wire;

use serde::{Deserialize, Serialize};

use crate::kernel::OperationKind;

pub use pool::{PoolStatus, WorkerPool};
pub use spawner::{ThreadSpawner, WorkerLink, WorkerSpawner};
pub use process::ProcessSpawner;

/// Arena key of a worker record. Never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Capabilities a worker reports in its `ready` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// Wide SIMD path for bulk particle / transform kernels.
    pub accelerated_path: bool,
    /// Secondary path favoured for inference-style kernels.
    pub secondary_path: bool,
    /// Relative throughput, 1.0 for a baseline worker.
    pub performance_score: f64,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            accelerated_path: false,
            secondary_path: false,
            performance_score: 1.0,
        }
    }
}

impl WorkerCapabilities {
    /// Detect what the current CPU offers.
    pub fn detect() -> Self {
        let accelerated_path = wide_simd_available();
        let secondary_path = fma_available();
        let mut performance_score = 1.0;
        if accelerated_path {
            performance_score += 0.25;
        }
        if secondary_path {
            performance_score += 0.1;
        }
        Self {
            accelerated_path,
            secondary_path,
            performance_score,
        }
    }

    /// Score multiplier for dispatching `op` to this worker.
    pub fn bonus(&self, op: OperationKind) -> f64 {
        match op {
            op if op.is_bulk() && self.accelerated_path => 1.5,
            OperationKind::Inference if self.secondary_path => 1.3,
            _ => 1.0,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn wide_simd_available() -> bool {
    std::arch::is_x86_feature_detected!("avx2")
}

#[cfg(target_arch = "aarch64")]
fn wide_simd_available() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn wide_simd_available() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
fn fma_available() -> bool {
    std::arch::is_x86_feature_detected!("fma")
}

#[cfg(target_arch = "aarch64")]
fn fma_available() -> bool {
    // FMA is part of the AArch64 base ASIMD set.
    std::arch::is_aarch64_feature_detected!("asimd")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn fma_available() -> bool {
    false
}

/// Status of a worker record in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Ready,
    Busy,
    Degraded,
    Evicted,
}

/// Severity reported by a worker that lost part of its capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeLevel {
    Minor,
    Major,
    Severe,
}

impl DegradeLevel {
    /// Multiplier applied to `performance_score`.
    pub fn score_factor(self) -> f64 {
        match self {
            DegradeLevel::Minor => 0.9,
            DegradeLevel::Major => 0.7,
            DegradeLevel::Severe => 0.5,
        }
    }
}

impl std::fmt::Display for DegradeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DegradeLevel::Minor => write!(f, "minor"),
            DegradeLevel::Major => write!(f, "major"),
            DegradeLevel::Severe => write!(f, "severe"),
        }
    }
}
