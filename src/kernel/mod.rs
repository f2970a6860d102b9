//! Compute kernels -- record layouts, exact kernels, software fallback.
//!
//! Workers and the accelerator run the exact kernels. The software tier runs
//! the cheaper approximations in [`fallback`]; results are close but not
//! bit-identical across tiers.

pub mod fallback;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Fixed integration step used to derive velocities from position deltas.
const FRAME_STEP: f32 = 0.016;

/// Workload kinds accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Particle simulation update.
    Particles,
    /// Bulk vec4 transform.
    Transform,
    /// Single dense layer over 8-wide activation records.
    Inference,
}

impl OperationKind {
    /// Scalars per compute-unit. Chunk boundaries always land on a multiple.
    pub const fn record_width(self) -> usize {
        match self {
            OperationKind::Particles => 10,
            OperationKind::Transform => 4,
            OperationKind::Inference => 8,
        }
    }

    /// Whether workers with the accelerated (SIMD) path favour this kind.
    pub const fn is_bulk(self) -> bool {
        matches!(self, OperationKind::Particles | OperationKind::Transform)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Particles => write!(f, "particles"),
            OperationKind::Transform => write!(f, "transform"),
            OperationKind::Inference => write!(f, "inference"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "particles" => Ok(OperationKind::Particles),
            "transform" => Ok(OperationKind::Transform),
            "inference" => Ok(OperationKind::Inference),
            other => Err(EngineError::InvalidPayload {
                reason: format!("unknown operation kind '{}'", other),
            }),
        }
    }
}

/// Per-task parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeParams {
    /// Seconds of simulated time.
    pub elapsed_time: f64,
    /// Animation mode for particle kernels (0 drift, 1 galaxy, 2 wave, 3 spiral).
    pub mode: u32,
    /// Global index of the first compute-unit in this payload.
    #[serde(default)]
    pub unit_offset: usize,
}

impl ComputeParams {
    pub fn new(elapsed_time: f64, mode: u32) -> Self {
        Self {
            elapsed_time,
            mode,
            unit_offset: 0,
        }
    }

    /// Same parameters shifted to a chunk starting at `unit_offset`.
    pub fn at_offset(self, unit_offset: usize) -> Self {
        Self {
            unit_offset: self.unit_offset + unit_offset,
            ..self
        }
    }
}

/// Number of compute-units in `data`, or `InvalidPayload` when the length is
/// not a whole number of records.
pub fn unit_count(op: OperationKind, data: &[f32]) -> EngineResult<usize> {
    let width = op.record_width();
    if data.len() % width != 0 {
        return Err(EngineError::InvalidPayload {
            reason: format!(
                "{} payload of {} values is not a multiple of {}",
                op,
                data.len(),
                width
            ),
        });
    }
    Ok(data.len() / width)
}

/// Exact kernel used by workers and the accelerator.
pub fn execute(op: OperationKind, params: &ComputeParams, data: &[f32]) -> EngineResult<Vec<f32>> {
    unit_count(op, data)?;
    let mut out = data.to_vec();
    match op {
        OperationKind::Particles => particles(params, &mut out),
        OperationKind::Transform => transform(params, &mut out),
        OperationKind::Inference => inference(&mut out),
    }
    Ok(out)
}

fn particles(params: &ComputeParams, data: &mut [f32]) {
    for (i, p) in data.chunks_exact_mut(10).enumerate() {
        let global = (params.unit_offset + i) as f64;
        let t = (params.elapsed_time + global * 0.001) as f32;
        let (x, y, z) = (p[0], p[1], p[2]);
        let phase = p[6];
        let intensity = p[7];
        let ptype = p[8];

        match params.mode {
            1 => {
                let radius = (x * x + z * z).sqrt();
                if radius > 0.001 {
                    let angle = t * 0.1 * (1.0 + intensity * 0.5);
                    let (s, c) = angle.sin_cos();
                    p[0] = x * c - z * s;
                    p[2] = x * s + z * c;
                    p[1] = y + (t * 2.0 + phase).sin() * 0.1 * intensity;
                    p[3] = (p[0] - x) / FRAME_STEP;
                    p[5] = (p[2] - z) / FRAME_STEP;
                }
            }
            2 => {
                let wave = (x * 2.0 + t * 5.0 + phase).sin() * 0.3;
                let secondary = (z * 1.5 + t * 3.0 + phase).sin() * 0.1;
                p[1] = y + (wave + secondary) * intensity * (1.0 + ptype * 0.2);
                p[4] = (p[1] - y) / FRAME_STEP;
            }
            3 => {
                let radius = (x * x + z * z).sqrt();
                if radius > 0.001 {
                    let angle = t * 0.2;
                    let (s, c) = angle.sin_cos();
                    p[0] = x * c - z * s;
                    p[2] = x * s + z * c;
                    p[1] = y + (t * 0.5 + phase).sin() * 0.2 * intensity;
                    p[3] = (p[0] - x) / FRAME_STEP;
                    p[4] = (p[1] - y) / FRAME_STEP;
                    p[5] = (p[2] - z) / FRAME_STEP;
                }
            }
            _ => {
                let drift = (t * 0.1 + phase).sin() * 0.05;
                p[0] = x + drift * intensity;
                p[1] = y + (t + phase).sin() * 0.1 * intensity;
                p[2] = z + drift * intensity;
                p[3] = (p[0] - x) / FRAME_STEP;
                p[4] = (p[1] - y) / FRAME_STEP;
                p[5] = (p[2] - z) / FRAME_STEP;
            }
        }
    }
}

fn transform(params: &ComputeParams, data: &mut [f32]) {
    let t = params.elapsed_time as f32;
    let (s, c) = (t * 0.5).sin_cos();
    let scale = 1.0 + 0.1 * t.sin();
    for v in data.chunks_exact_mut(4) {
        let (x, z) = (v[0], v[2]);
        v[0] = (x * c - z * s) * scale;
        v[1] *= scale;
        v[2] = (x * s + z * c) * scale;
    }
}

/// Weight of the fixed 8x8 layer.
pub(crate) fn weight(row: usize, col: usize) -> f32 {
    ((row * 8 + col) as f32 * 0.37).sin() * 0.5
}

pub(crate) fn bias(row: usize) -> f32 {
    (row as f32 * 0.11).cos() * 0.1
}

pub(crate) fn dense(input: &[f32], row: usize) -> f32 {
    input
        .iter()
        .enumerate()
        .map(|(col, x)| weight(row, col) * x)
        .sum::<f32>()
        + bias(row)
}

fn inference(data: &mut [f32]) {
    let mut input = [0.0f32; 8];
    for rec in data.chunks_exact_mut(8) {
        input.copy_from_slice(rec);
        for (row, out) in rec.iter_mut().enumerate() {
            *out = dense(&input, row).tanh();
        }
    }
}

/// Run [`execute`] on the blocking pool so async callers never stall the runtime.
pub async fn execute_blocking(
    op: OperationKind,
    params: ComputeParams,
    data: Vec<f32>,
) -> EngineResult<Vec<f32>> {
    tokio::task::spawn_blocking(move || execute(op, &params, &data))
        .await
        .map_err(|e| EngineError::TaskExecutionError {
            reason: format!("kernel task aborted: {}", e),
        })?
}
