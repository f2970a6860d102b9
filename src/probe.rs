//! Host capability probe.
//!
//! Reports which execution tiers this machine can offer: SIMD kernels for
//! workers, a Vulkan device for accelerator limits, a working worker
//! transport, and the software kernels themselves.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::info;

use crate::accel::vulkan;
use crate::config::{AcceleratorBackend, EngineConfig};
use crate::engine::default_spawner;
use crate::kernel::{self, fallback, ComputeParams, OperationKind};
use crate::worker::protocol::{HostMessage, WorkerMessage};
use crate::worker::{WorkerCapabilities, WorkerId};

/// Run every capability check.
pub async fn run(config: &EngineConfig) -> ProbeReport {
    info!("Probe: checking offload tiers...");

    let mut results = Vec::new();

    // 1. CPU SIMD
    results.push(check_simd());

    // 2. Accelerator device
    if config.accelerator.backend == AcceleratorBackend::None {
        results.push(ComponentResult {
            component: "Accelerator".to_string(),
            status: TestStatus::Skipped,
            details: "accelerator backend disabled in config".to_string(),
            remediation: None,
        });
    } else {
        match tokio::task::spawn_blocking(vulkan::probe).await {
            Ok(Ok(limits)) => results.push(ComponentResult {
                component: "Accelerator".to_string(),
                status: TestStatus::Pass,
                details: format!(
                    "{} (max buffer {} bytes, workgroup {})",
                    limits.adapter.as_deref().unwrap_or("unknown adapter"),
                    limits
                        .max_buffer_bytes
                        .map_or_else(|| "?".to_string(), |b| b.to_string()),
                    limits
                        .max_workgroup_size
                        .map_or_else(|| "?".to_string(), |w| w.to_string()),
                ),
                remediation: None,
            }),
            Ok(Err(e)) => results.push(ComponentResult {
                component: "Accelerator".to_string(),
                status: TestStatus::Warning,
                details: format!("No Vulkan device: {:#}", e),
                remediation: Some(
                    "Install a Vulkan loader and driver; the host lane runs without limits."
                        .to_string(),
                ),
            }),
            Err(e) => results.push(ComponentResult {
                component: "Accelerator".to_string(),
                status: TestStatus::Warning,
                details: format!("Probe task failed: {}", e),
                remediation: None,
            }),
        }
    }

    // 3. Worker transport
    match check_transport(config).await {
        Ok(res) => results.push(res),
        Err(e) => results.push(ComponentResult {
            component: "Worker Transport".to_string(),
            status: TestStatus::Fail,
            details: format!("{:#}", e),
            remediation: Some(format!(
                "Check pool.transport ({:?}) and pool.worker_program.",
                config.pool.transport
            )),
        }),
    }

    // 4. Software kernels
    results.push(check_kernels());

    info!("Probe complete. {} check(s) run.", results.len());

    let tiers = available_tiers(&results);
    ProbeReport { results, tiers }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub results: Vec<ComponentResult>,
    pub tiers: BTreeMap<String, bool>, // Tier name -> usable
}

fn available_tiers(results: &[ComponentResult]) -> BTreeMap<String, bool> {
    let status_of = |name: &str| -> TestStatus {
        results
            .iter()
            .find(|r| r.component == name)
            .map(|r| r.status.clone())
            .unwrap_or(TestStatus::Fail)
    };

    let mut map = BTreeMap::new();
    // The host lane serves the accelerator tier even without a Vulkan device.
    map.insert(
        "accelerator".to_string(),
        matches!(status_of("Accelerator"), TestStatus::Pass | TestStatus::Warning),
    );
    map.insert(
        "worker".to_string(),
        status_of("Worker Transport") == TestStatus::Pass,
    );
    map.insert(
        "software".to_string(),
        status_of("Kernels") == TestStatus::Pass,
    );
    map
}

fn check_simd() -> ComponentResult {
    let caps = WorkerCapabilities::detect();
    let status = if caps.accelerated_path {
        TestStatus::Pass
    } else {
        TestStatus::Warning
    };
    ComponentResult {
        component: "CPU SIMD".to_string(),
        status,
        details: format!(
            "accelerated path: {}, secondary path: {}, score {:.2}",
            caps.accelerated_path, caps.secondary_path, caps.performance_score
        ),
        remediation: (!caps.accelerated_path)
            .then(|| "Workers will run scalar kernels.".to_string()),
    }
}

/// Spawn one worker over the configured transport and ping it.
async fn check_transport(config: &EngineConfig) -> Result<ComponentResult> {
    let spawner = default_spawner(config)?;
    let spawn_timeout = config.pool.spawn_timeout();
    let start = Instant::now();

    let mut link = spawner
        .spawn(WorkerId(0))
        .await
        .with_context(|| format!("{} spawner failed", spawner.name()))?;

    let ready = timeout(spawn_timeout, link.rx.recv())
        .await
        .with_context(|| format!("no ready message within {:?}", spawn_timeout))?;
    match ready {
        Some(WorkerMessage::Ready { .. }) => {}
        other => return Err(anyhow!("unexpected handshake: {:?}", other)),
    }
    let handshake = start.elapsed();

    let ping_at = Instant::now();
    link.tx
        .send(HostMessage::Ping { seq: 1 })
        .await
        .context("worker closed before ping")?;
    let pong = timeout(config.pool.health_interval(), link.rx.recv())
        .await
        .context("no pong within health interval")?;
    if !matches!(pong, Some(WorkerMessage::Pong { seq: 1 })) {
        return Err(anyhow!("unexpected ping reply: {:?}", pong));
    }
    let round_trip = ping_at.elapsed();

    let _ = link.tx.send(HostMessage::Shutdown).await;

    Ok(ComponentResult {
        component: "Worker Transport".to_string(),
        status: TestStatus::Pass,
        details: format!(
            "{} worker ready in {} ms, ping {} us",
            spawner.name(),
            handshake.as_millis(),
            round_trip.as_micros()
        ),
        remediation: None,
    })
}

/// Compare the software transform against the exact kernel.
fn check_kernels() -> ComponentResult {
    let data: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
    let params = ComputeParams::new(1.25, 0);
    let compared = kernel::execute(OperationKind::Transform, &params, &data).and_then(|exact| {
        fallback::approximate(OperationKind::Transform, &params, &data).map(|approx| {
            exact
                .iter()
                .zip(&approx)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max)
        })
    });

    match compared {
        Ok(max_err) if max_err < SOFTWARE_TOLERANCE => ComponentResult {
            component: "Kernels".to_string(),
            status: TestStatus::Pass,
            details: format!("software transform within {:.1e} of exact", max_err),
            remediation: None,
        },
        Ok(max_err) => ComponentResult {
            component: "Kernels".to_string(),
            status: TestStatus::Warning,
            details: format!("software transform deviates by {:.3}", max_err),
            remediation: None,
        },
        Err(e) => ComponentResult {
            component: "Kernels".to_string(),
            status: TestStatus::Fail,
            details: e.to_string(),
            remediation: None,
        },
    }
}

const SOFTWARE_TOLERANCE: f32 = 0.05;

/// Probe result for a single component.
#[derive(Debug, Serialize, Clone)]
pub struct ComponentResult {
    pub component: String,
    pub status: TestStatus,
    pub details: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
    Warning,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_accelerator() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.accelerator.backend = AcceleratorBackend::None;
        config
    }

    #[tokio::test]
    async fn test_thread_transport_passes() {
        let report = run(&disabled_accelerator()).await;
        let transport = report
            .results
            .iter()
            .find(|r| r.component == "Worker Transport")
            .unwrap();
        assert_eq!(transport.status, TestStatus::Pass, "{}", transport.details);
        assert_eq!(report.tiers["worker"], true);
    }

    #[tokio::test]
    async fn test_disabled_accelerator_is_skipped() {
        let report = run(&disabled_accelerator()).await;
        let accel = report
            .results
            .iter()
            .find(|r| r.component == "Accelerator")
            .unwrap();
        assert_eq!(accel.status, TestStatus::Skipped);
        assert_eq!(report.tiers["accelerator"], false);
    }

    #[test]
    fn test_missing_components_count_as_unusable() {
        let tiers = available_tiers(&[]);
        assert_eq!(tiers["worker"], false);
        assert_eq!(tiers["software"], false);
        assert_eq!(tiers["accelerator"], false);
    }
}
