//! Leakforge - concurrent workload harness with fault injection
//!
//! Entry point for the `leakforge` binary: loads configuration, runs the
//! workload and prints the run report.

use clap::{Parser, Subcommand};
use leakforge_core::{
    diagnostics::{global_memory_tracker, start_memory_monitoring},
    error::{HarnessError, Result},
    FaultPlan, Harness, HarnessConfig,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "leakforge")]
#[command(about = "Concurrent workload harness with fault injection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Set log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulated workload (default)
    Run {
        /// Configuration file (TOML)
        #[arg(short, long, env = "LEAKFORGE_CONFIG")]
        config: Option<PathBuf>,

        /// Number of simulated calls
        #[arg(long)]
        calls: Option<usize>,

        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Seed for every random draw
        #[arg(long)]
        seed: Option<u64>,

        /// random | none | always:<selector> | every:<n>:<selector>
        #[arg(short, long)]
        fault_plan: Option<FaultPlan>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (TOML)
        #[arg(short, long, env = "LEAKFORGE_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            HarnessConfig::from_file(path)
        }
        None => Ok(HarnessConfig::default()),
    }
}

async fn run_workload(config: HarnessConfig, json: bool) -> Result<()> {
    let monitor = start_memory_monitoring(
        global_memory_tracker().clone(),
        Duration::from_secs(config.monitoring.interval_secs),
    );

    let harness = Harness::new(config)?;
    let report = tokio::task::spawn_blocking(move || harness.run())
        .await
        .map_err(|e| HarnessError::Other(format!("Harness thread failed: {}", e)))??;
    monitor.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }

    if !report.is_consistent() {
        return Err(HarnessError::Other(format!(
            "{} of {} submitted calls never completed",
            report.submitted() - report.completed(),
            report.submitted()
        )));
    }
    if report.task_failures > 0 {
        warn!("{} calls failed", report.task_failures);
    }

    info!("Simulation complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::new(format!(
        "leakforge={level},leakforge_core={level}",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Report goes to stdout
        .init();

    debug!("Leakforge v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(Commands::Run {
            config,
            calls,
            workers,
            seed,
            fault_plan,
            json,
        }) => {
            let mut config = load_config(config.as_deref())?;
            if let Some(calls) = calls {
                config.workload.calls = calls;
            }
            if let Some(workers) = workers {
                config.workload.workers = workers;
            }
            if seed.is_some() {
                config.workload.seed = seed;
            }
            if let Some(plan) = fault_plan {
                config.faults = plan.to_settings();
            }
            run_workload(config, json).await
        }
        Some(Commands::Config { config }) => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        None => run_workload(HarnessConfig::default(), false).await,
    }
}
