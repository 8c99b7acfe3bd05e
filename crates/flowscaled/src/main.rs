//! flowscaled — the Flowscale daemon.
//!
//! Single binary that assembles the autoscaling control plane:
//! - State store (redb)
//! - Policy engine + idle/wake tracker
//! - Node pool manager + reconciler
//! - Simulated cloud provider (standalone mode)
//!
//! # Usage
//!
//! ```text
//! flowscaled standalone --config /etc/flowscale/flowscale.toml --data-dir /var/lib/flowscale
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flowscaled::{ControlPlane, FlowscaleConfig};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowscaled", about = "Flowscale autoscaling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (all subsystems in one process).
    Standalone {
        /// Configuration file. Defaults apply when it does not exist.
        #[arg(long, default_value = "flowscale.toml")]
        config: PathBuf,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Config {
        #[arg(long, default_value = "flowscale.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,flowscale=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone { config, data_dir } => {
            let mut config = FlowscaleConfig::load(&config)?;
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            run_standalone(config).await
        }
        Command::Config { config } => {
            print!("{}", FlowscaleConfig::load(&config)?.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_standalone(config: FlowscaleConfig) -> anyhow::Result<()> {
    info!("Flowscale daemon starting in standalone mode");

    let plane = ControlPlane::open(&config, &config.data_dir)?;
    info!(
        evaluation_interval_secs = config.evaluation.interval_secs,
        reconcile_interval_secs = config.reconcile.interval_secs,
        "control plane assembled"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    plane.run(&config, shutdown_rx).await;
    signal.abort();

    info!("Flowscale daemon stopped");
    Ok(())
}
