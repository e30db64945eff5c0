//! governor - supervisory state manager for beamline positioners
//!
//! Compiles one state machine per configuration file, binds them to the
//! PV bus under the `{Gov...}` namespace, and runs until killed.

use clap::Parser;
use governor_core::{config, sim, MachineConfig, Supervisor, SyncMap};
use governor_pv::{MemoryBus, PvBinding};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "governor")]
#[command(about = "Supervisory state manager for a shared motion envelope")]
#[command(version)]
struct Cli {
    /// Configuration files to load, one machine each
    #[arg(short = 'c', long = "config", required = true, num_args = 1..)]
    config: Vec<PathBuf>,

    /// Check configuration files and exit
    #[arg(long)]
    check_config: bool,

    /// Log level
    #[arg(short = 'l', long = "log_level", default_value = "INFO",
          value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    log_level: String,

    /// Prefix for every published channel name
    #[arg(long, default_value = "")]
    prefix: String,

    /// Synchronization config file
    #[arg(short = 's', long)]
    sync: Option<PathBuf>,
}

fn log_filter(level: &str) -> &'static str {
    match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(&cli.log_level))),
        )
        .init();
    tracing::info!("The Governor");

    // Load and validate every configuration; report all problems at once.
    let mut configs = Vec::new();
    let mut failed = false;
    for path in &cli.config {
        match MachineConfig::from_file(path) {
            Ok(config) => {
                if let Err(err) = config.validate() {
                    tracing::error!("invalid config file {}: {}", path.display(), err);
                    failed = true;
                }
                configs.push(config);
            }
            Err(err) => {
                tracing::error!("cannot load config file {}: {}", path.display(), err);
                failed = true;
            }
        }
    }

    let sync = match &cli.sync {
        Some(path) => match config::load_sync_map(path) {
            Ok(sync) => {
                if let Err(err) = config::validate_sync(&sync, &configs) {
                    tracing::error!("invalid sync file {}: {}", path.display(), err);
                    failed = true;
                }
                sync
            }
            Err(err) => {
                tracing::error!("cannot load sync file {}: {}", path.display(), err);
                failed = true;
                SyncMap::new()
            }
        },
        None => SyncMap::new(),
    };

    if failed {
        return ExitCode::FAILURE;
    }
    tracing::info!("configuration files {:?} loaded", cli.config);
    if cli.check_config {
        return ExitCode::SUCCESS;
    }

    // Compile the machines and wire up the bus.
    let supervisor = match Supervisor::new(&configs, sync, |_, _, device| sim::default_io(device)) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            tracing::error!("startup failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let (bus, writes) = MemoryBus::new();
    let _binding = PvBinding::start(supervisor.clone(), bus, writes, cli.prefix.clone());

    // Run until Kill-Cmd or Ctrl-C.
    let mut shutdown = supervisor.subscribe_shutdown();
    tokio::select! {
        _ = shutdown.recv() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            supervisor.kill().await;
        }
    }

    // Give device stops and final publishes a moment to drain.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    tracing::info!("stopped");
    ExitCode::SUCCESS
}
