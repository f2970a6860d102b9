//! TOML configuration for the offload engine.
//!
//! Layered model: every section has compiled-in defaults, a config file may
//! override any subset of fields, and the file path can be supplied through
//! the `OFFLOADENGINE_CONFIG` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "OFFLOADENGINE_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/offloadengine/offloadengine.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for an engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub accelerator: AcceleratorConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Try, in order: `$OFFLOADENGINE_CONFIG`, the system path, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "OFFLOADENGINE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// How worker processes are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTransport {
    /// Workers run as tasks inside this process and talk over channels.
    Thread,
    /// Workers are child processes speaking framed JSON over stdio.
    Process,
}

/// Worker pool sizing, timeouts and health monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers spawned by `initialize`.
    pub target_size: usize,
    /// Per-attempt budget for spawn plus `ready` handshake.
    pub spawn_timeout_ms: u64,
    /// Per-task (and per-chunk) budget before the software fallback runs.
    pub task_timeout_ms: u64,
    /// In-flight tasks per worker before it counts as busy.
    pub max_in_flight_per_worker: usize,
    /// Replacement spawns are attempted while the pool is below this size.
    pub min_pool_size: usize,
    /// Interval between liveness pings.
    pub health_interval_ms: u64,
    pub transport: WorkerTransport,
    /// Program launched for `process` workers. Defaults to the current executable.
    pub worker_program: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 4,
            spawn_timeout_ms: 20_000,
            task_timeout_ms: 5_000,
            max_in_flight_per_worker: 2,
            min_pool_size: 2,
            health_interval_ms: 5_000,
            transport: WorkerTransport::Thread,
            worker_program: None,
        }
    }
}

impl PoolConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Accelerator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorBackend {
    /// Host compute lane with limits taken from the Vulkan probe.
    Host,
    /// No accelerator; the gateway fails acquisition and stays `Failed`.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub backend: AcceleratorBackend,
    /// Budget for one accelerator dispatch before resolving via fallback.
    pub compute_timeout_ms: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            backend: AcceleratorBackend::Host,
            compute_timeout_ms: 10_000,
        }
    }
}

impl AcceleratorConfig {
    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Payloads at or above this many compute-units are chunked.
    pub chunk_threshold_units: usize,
    /// Per-chunk cap used when the accelerator reports no buffer limit.
    pub max_chunk_units: usize,
    /// Upper bound on chunks per job.
    pub max_parallel_chunks: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_units: 20_000,
            max_chunk_units: 15_000,
            max_parallel_chunks: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Global budget for running every cleanup hook.
    pub shutdown_budget_ms: u64,
    /// How long a paused engine waits before escalating to shutdown.
    pub hidden_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_budget_ms: 2_000,
            hidden_grace_ms: 30_000,
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_budget_ms)
    }

    pub fn hidden_grace(&self) -> Duration {
        Duration::from_millis(self.hidden_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = EngineConfig::default();

        assert_eq!(cfg.pool.target_size, 4);
        assert_eq!(cfg.pool.spawn_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.pool.max_in_flight_per_worker, 2);
        assert_eq!(cfg.pool.min_pool_size, 2);
        assert_eq!(cfg.pool.transport, WorkerTransport::Thread);
        assert!(cfg.pool.worker_program.is_none());

        assert_eq!(cfg.accelerator.backend, AcceleratorBackend::Host);
        assert_eq!(cfg.accelerator.compute_timeout(), Duration::from_secs(10));

        assert_eq!(cfg.distributor.chunk_threshold_units, 20_000);
        assert_eq!(cfg.distributor.max_chunk_units, 15_000);
        assert_eq!(cfg.distributor.max_parallel_chunks, 4);

        assert_eq!(cfg.lifecycle.shutdown_budget(), Duration::from_millis(2_000));
        assert_eq!(cfg.lifecycle.hidden_grace(), Duration::from_secs(30));

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[pool]
target_size = 8
spawn_timeout_ms = 1500
task_timeout_ms = 250
transport = "process"
worker_program = "/usr/local/bin/offloadengine"

[accelerator]
backend = "none"
compute_timeout_ms = 500

[distributor]
chunk_threshold_units = 1000
max_chunk_units = 300

[lifecycle]
shutdown_budget_ms = 750
hidden_grace_ms = 5000

[logging]
level = "debug"
json = true
"#;

        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.pool.target_size, 8);
        assert_eq!(cfg.pool.spawn_timeout_ms, 1500);
        assert_eq!(cfg.pool.task_timeout_ms, 250);
        assert_eq!(cfg.pool.transport, WorkerTransport::Process);
        assert_eq!(
            cfg.pool.worker_program,
            Some(PathBuf::from("/usr/local/bin/offloadengine"))
        );
        // Unset field in a present section keeps its default.
        assert_eq!(cfg.pool.min_pool_size, 2);
        assert_eq!(cfg.accelerator.backend, AcceleratorBackend::None);
        assert_eq!(cfg.accelerator.compute_timeout_ms, 500);
        assert_eq!(cfg.distributor.chunk_threshold_units, 1000);
        assert_eq!(cfg.distributor.max_chunk_units, 300);
        assert_eq!(cfg.distributor.max_parallel_chunks, 4);
        assert_eq!(cfg.lifecycle.shutdown_budget_ms, 750);
        assert_eq!(cfg.lifecycle.hidden_grace_ms, 5000);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        let defaults = EngineConfig::default();

        assert_eq!(cfg.pool.target_size, defaults.pool.target_size);
        assert_eq!(
            cfg.distributor.chunk_threshold_units,
            defaults.distributor.chunk_threshold_units
        );
        assert_eq!(
            cfg.lifecycle.hidden_grace_ms,
            defaults.lifecycle.hidden_grace_ms
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("offloadengine.toml");
        std::fs::write(
            &path,
            r#"
[pool]
target_size = 2
"#,
        )
        .unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.pool.target_size, 2);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = EngineConfig::load(Path::new("/nonexistent/path/offloadengine.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_rendered_toml_parses_back() {
        let cfg = EngineConfig::default();
        let rendered = cfg.to_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.pool.task_timeout_ms, cfg.pool.task_timeout_ms);
        assert_eq!(parsed.accelerator.backend, cfg.accelerator.backend);
    }
}
