//! Accelerator tier -- device abstraction, gateway state machine, Vulkan probe.
//!
//! A single accelerator context is owned by [`gateway::AcceleratorGateway`].
//! The `host` backend runs the exact kernels on the blocking pool with limits
//! read from the Vulkan probe; the `none` backend never becomes ready.

pub mod device;
pub mod gateway;
pub mod host;
pub mod vulkan;

use std::sync::Arc;

use serde::Serialize;

use crate::config::AcceleratorBackend;

pub use device::{AcceleratorContext, AcceleratorDevice, DeviceLimits, NullDevice};
pub use gateway::AcceleratorGateway;
pub use host::HostDevice;

/// Gateway state. `Failed` is sticky until a manual re-probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl std::fmt::Display for AcceleratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceleratorState::Uninitialized => write!(f, "uninitialized"),
            AcceleratorState::Initializing => write!(f, "initializing"),
            AcceleratorState::Ready => write!(f, "ready"),
            AcceleratorState::Failed => write!(f, "failed"),
        }
    }
}

/// Which execution tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Accelerator context
    Accelerator,
    /// Worker pool, single task or chunked
    Worker,
    /// In-process software approximation
    Software,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Accelerator => write!(f, "accelerator"),
            Tier::Worker => write!(f, "worker"),
            Tier::Software => write!(f, "software"),
        }
    }
}

/// Build the device for a configured backend.
pub fn device_for(backend: AcceleratorBackend) -> Arc<dyn AcceleratorDevice> {
    match backend {
        AcceleratorBackend::Host => Arc::new(HostDevice::new()),
        AcceleratorBackend::None => Arc::new(NullDevice),
    }
}
