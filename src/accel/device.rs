use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::kernel::{ComputeParams, OperationKind};

/// Capability and limit record published by an acquired context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceLimits {
    /// Adapter / device name, if the backend can report one.
    pub adapter: Option<String>,
    /// Largest storage buffer a single dispatch may bind, in bytes.
    pub max_buffer_bytes: Option<u64>,
    /// Largest workgroup along X.
    pub max_workgroup_size: Option<u32>,
    pub features: Vec<String>,
}

impl DeviceLimits {
    /// Compute-units of `op` that fit in one buffer binding.
    pub fn max_units(&self, op: OperationKind) -> Option<usize> {
        let bytes_per_unit = (op.record_width() * std::mem::size_of::<f32>()) as u64;
        self.max_buffer_bytes
            .map(|bytes| (bytes / bytes_per_unit) as usize)
            .filter(|units| *units > 0)
    }
}

/// A source of accelerator contexts.
#[async_trait]
pub trait AcceleratorDevice: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Acquire a live context. Any error moves the gateway to `Failed`.
    async fn acquire(&self) -> EngineResult<Box<dyn AcceleratorContext>>;
}

/// A live accelerator context.
#[async_trait]
pub trait AcceleratorContext: Send + Sync {
    fn limits(&self) -> DeviceLimits;

    /// Run one kernel over `data`.
    async fn dispatch(
        &self,
        op: OperationKind,
        params: ComputeParams,
        data: Vec<f32>,
    ) -> EngineResult<Vec<f32>>;

    /// Cancelled by the context when it is lost asynchronously.
    fn lost(&self) -> CancellationToken;
}

/// A device that is never present.
pub struct NullDevice;

#[async_trait]
impl AcceleratorDevice for NullDevice {
    fn name(&self) -> &str {
        "none"
    }

    async fn acquire(&self) -> EngineResult<Box<dyn AcceleratorContext>> {
        Err(EngineError::InitializationFailure {
            reason: "no accelerator configured".to_string(),
        })
    }
}
