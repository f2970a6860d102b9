//! Host compute lane.
//!
//! Executes the exact kernels on tokio's blocking pool, one workgroup-sized
//! slice of units at a time. Limits are taken from the Vulkan probe when a device is present so
//! chunk sizing matches the hardware the host would bind against; otherwise
//! the context publishes no buffer limit and callers use their defaults.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::device::{AcceleratorContext, AcceleratorDevice, DeviceLimits};
use crate::error::{EngineError, EngineResult};
use crate::kernel::{self, ComputeParams, OperationKind};

const DEFAULT_WORKGROUP: u32 = 256;

pub struct HostDevice {
    probe_vulkan: bool,
}

impl HostDevice {
    pub fn new() -> Self {
        Self { probe_vulkan: true }
    }

    /// Skip the Vulkan probe; limits stay unknown.
    pub fn without_probe() -> Self {
        Self {
            probe_vulkan: false,
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcceleratorDevice for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    async fn acquire(&self) -> EngineResult<Box<dyn AcceleratorContext>> {
        let mut limits = if self.probe_vulkan {
            match tokio::task::spawn_blocking(super::vulkan::probe).await {
                Ok(Ok(limits)) => limits,
                Ok(Err(e)) => {
                    debug!(error = %e, "Vulkan probe unavailable, publishing default limits");
                    DeviceLimits::default()
                }
                Err(e) => {
                    debug!(error = %e, "Vulkan probe task failed");
                    DeviceLimits::default()
                }
            }
        } else {
            DeviceLimits::default()
        };

        limits.max_workgroup_size.get_or_insert(DEFAULT_WORKGROUP);
        limits.features.push("host-lane".to_string());
        info!(adapter = ?limits.adapter, max_buffer_bytes = ?limits.max_buffer_bytes, "host accelerator context acquired");

        Ok(Box::new(HostContext {
            limits,
            lost: CancellationToken::new(),
        }))
    }
}

struct HostContext {
    limits: DeviceLimits,
    lost: CancellationToken,
}

#[async_trait]
impl AcceleratorContext for HostContext {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    async fn dispatch(
        &self,
        op: OperationKind,
        params: ComputeParams,
        data: Vec<f32>,
    ) -> EngineResult<Vec<f32>> {
        let workgroup = (self.limits.max_workgroup_size.unwrap_or(DEFAULT_WORKGROUP) as usize).max(1);
        let units = kernel::unit_count(op, &data)?;
        let groups = units.div_ceil(workgroup);
        debug!(%op, units, groups, "host dispatch");

        tokio::task::spawn_blocking(move || run_groups(op, params, &data, workgroup))
            .await
            .map_err(|e| EngineError::TaskExecutionError {
                reason: format!("host dispatch aborted: {}", e),
            })?
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }
}

/// Run `data` through the kernel `workgroup` units at a time, each slice at
/// its own unit offset.
fn run_groups(
    op: OperationKind,
    params: ComputeParams,
    data: &[f32],
    workgroup: usize,
) -> EngineResult<Vec<f32>> {
    let mut out = Vec::with_capacity(data.len());
    for (i, group) in data.chunks(workgroup * op.record_width()).enumerate() {
        out.extend(kernel::execute(op, &params.at_offset(i * workgroup), group)?);
    }
    Ok(out)
}
