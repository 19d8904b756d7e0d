//! rackd: the rack control plane daemon.
//!
//! Assembles the provider for the configured binding and runs the
//! background workers until interrupted.
//!
//! # Usage
//!
//! ```text
//! PROVIDER=local RACK=convox rackd run --data-dir /var/lib/rackd
//! rackd config
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rackd", about = "Rack control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane workers until interrupted.
    Run {
        /// Data directory for persistent state; overrides DATA_DIR.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration with credentials masked.
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rackd=debug,rackplane=debug"));
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
        Command::Run { data_dir } => run(data_dir).await,
        Command::Config => {
            let config = rackd::load_config(None)?;
            print!("{}", config.redacted().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!("rack daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let config = rackd::load_config(data_dir.as_deref())?;
    let rack = rackd::assemble(config)?;
    rack.bootstrap();

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let handles = rackplane_workers::spawn_workers(&rack.provider, &shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("rack daemon stopped");
    Ok(())
}
