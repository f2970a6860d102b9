use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;

use offloadengine::config::{EngineConfig, CONFIG_ENV};
use offloadengine::kernel::{ComputeParams, OperationKind};
use offloadengine::probe::TestStatus;
use offloadengine::worker::WorkerCapabilities;
use offloadengine::OffloadEngine;

#[derive(Parser)]
#[command(
    name = "offloadengine",
    about = "Compute offload engine with worker pool, accelerator gateway and tiered fallback",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $OFFLOADENGINE_CONFIG, then /etc/offloadengine)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a generated workload through the engine and report the outcome
    Run {
        /// Operation: particles, transform or inference
        #[arg(long, default_value = "particles")]
        op: OperationKind,

        /// Number of compute-units to generate
        #[arg(long, default_value = "40000")]
        units: usize,

        /// Kernel mode (particles: 0 drift, 1 orbit, 2 wave, 3 spiral)
        #[arg(long, default_value = "0")]
        mode: u32,

        /// Number of submissions
        #[arg(long, default_value = "1")]
        repeat: u32,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Serve as a worker over stdin/stdout (spawned by the process transport)
    Worker,

    /// Probe the tiers this host can offer (SIMD, Vulkan, worker transport)
    Probe {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Start the engine with its status API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(),
    };

    // Initialize tracing. stdout is reserved for command output and frames.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Run {
            op,
            units,
            mode,
            repeat,
            json,
        } => {
            tracing::info!(%op, units, mode, repeat, "Running workload");
            run_workload(config, op, units, mode, repeat, json).await?;
        }
        Commands::Worker => {
            offloadengine::worker::process::run_stdio_worker(WorkerCapabilities::detect()).await?;
        }
        Commands::Probe { json } => {
            tracing::info!("Running capability probe");
            let report = offloadengine::probe::run(&config).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\noffloadengine capability probe");
                println!("{:<20} | {:<10} | Details", "Component", "Status");
                println!("{:-<20}-|-{:-<10}-|-{:-<40}", "", "", "");
                for res in &report.results {
                    let status_str = match res.status {
                        TestStatus::Pass => "PASS",
                        TestStatus::Fail => "FAIL",
                        TestStatus::Warning => "WARN",
                        TestStatus::Skipped => "SKIP",
                    };
                    println!("{:<20} | {:<10} | {}", res.component, status_str, res.details);
                    if let Some(rem) = &res.remediation {
                        println!("{:<20} | {:<10} |   -> Recommendation: {}", "", "", rem);
                    }
                }
                println!("\n=== Tiers ===");
                for (tier, usable) in &report.tiers {
                    let check = if *usable { "available" } else { "unavailable" };
                    println!("{:<20} : {}", tier, check);
                }
                println!();
            }
        }
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting offloadengine");
            offloadengine::serve(&bind, config).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_workload(
    config: EngineConfig,
    op: OperationKind,
    units: usize,
    mode: u32,
    repeat: u32,
    json: bool,
) -> Result<()> {
    let engine = OffloadEngine::builder(config).build()?;
    engine.initialize().await?;

    let mut rng = rand::thread_rng();
    let mut outcomes = Vec::new();
    for _ in 0..repeat {
        let data: Vec<f32> = (0..units * op.record_width())
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        let params = ComputeParams::new(engine.uptime().as_secs_f64(), mode);
        let outcome = engine.submit(op, data, params).await?;
        outcomes.push((outcome.tier.to_string(), outcome.chunks, outcome.fallback_chunks));
    }

    let metrics = engine.get_metrics().await;
    let report = engine.shutdown().await;

    if json {
        let out = serde_json::json!({ "metrics": metrics, "shutdown": report });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("\n=== offloadengine run: {} x {} {} units ===", repeat, units, op);
        for (i, (tier, chunks, fallbacks)) in outcomes.iter().enumerate() {
            println!(
                "#{:<3} tier {:<12} chunks {:<3} fallback chunks {}",
                i + 1,
                tier,
                chunks,
                fallbacks
            );
        }
        println!("Workers:       {}", metrics.active_workers);
        println!("Accelerator:   {}", metrics.accelerator_state);
        println!("Avg latency:   {:.2} ms", metrics.avg_latency_ms);
        println!("Units/sec:     {:.0}", metrics.units_per_second);
        println!(
            "Shutdown:      {} completed, {} failed, {} skipped in {} ms",
            report.completed.len(),
            report.failed.len(),
            report.skipped.len(),
            report.elapsed_ms
        );
        println!();
    }

    Ok(())
}
