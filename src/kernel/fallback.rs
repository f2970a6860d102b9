//! Software fallback kernels.
//!
//! Cheaper approximations of the exact kernels: particles only rotate or
//! bob, transforms use truncated series for sin/cos, inference uses a hard
//! tanh. They run when every faster tier has failed or timed out.

use super::{dense, unit_count, ComputeParams, OperationKind};
use crate::error::{EngineError, EngineResult};

pub fn approximate(
    op: OperationKind,
    params: &ComputeParams,
    data: &[f32],
) -> EngineResult<Vec<f32>> {
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
    let dt = params.elapsed_time;
    for (i, p) in data.chunks_exact_mut(10).enumerate() {
        let global = (params.unit_offset + i) as f64;
        match params.mode {
            1 => {
                let (x, z) = (p[0] as f64, p[2] as f64);
                let radius = (x * x + z * z).sqrt();
                if radius > 0.001 {
                    let angle = z.atan2(x) + dt * 0.5;
                    p[0] = (radius * angle.cos()) as f32;
                    p[2] = (radius * angle.sin()) as f32;
                }
            }
            _ => {
                p[1] += ((dt * 3.0 + global * 0.01).sin() * 0.1) as f32;
            }
        }
    }
}

fn transform(params: &ComputeParams, data: &mut [f32]) {
    let t = params.elapsed_time as f32;
    let a = t * 0.5;
    let s = a - a * a * a / 6.0;
    let c = 1.0 - a * a / 2.0;
    let scale = 1.0 + 0.1 * (t - t * t * t / 6.0);
    for v in data.chunks_exact_mut(4) {
        let (x, z) = (v[0], v[2]);
        v[0] = (x * c - z * s) * scale;
        v[1] *= scale;
        v[2] = (x * s + z * c) * scale;
    }
}

fn inference(data: &mut [f32]) {
    let mut input = [0.0f32; 8];
    for rec in data.chunks_exact_mut(8) {
        input.copy_from_slice(rec);
        for (row, out) in rec.iter_mut().enumerate() {
            *out = dense(&input, row).clamp(-1.0, 1.0);
        }
    }
}

/// Run the fallback on the blocking pool.
pub async fn approximate_blocking(
    op: OperationKind,
    params: ComputeParams,
    data: Vec<f32>,
) -> EngineResult<Vec<f32>> {
    tokio::task::spawn_blocking(move || approximate(op, &params, &data))
        .await
        .map_err(|e| EngineError::TaskExecutionError {
            reason: format!("software fallback aborted: {}", e),
        })?
}
