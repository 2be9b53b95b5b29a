use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use open_r::config::Config;
use open_r::daemon::Daemon;
use open_r::platform::LoggingPlatform;
use open_r::spark::UdpNeighborIo;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Distributed link-state routing daemon.
#[derive(Parser)]
#[command(name = "open-r")]
#[command(version = VERSION)]
#[command(about = "Distributed link-state routing daemon")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Use RUST_LOG if set, otherwise default to info
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("open_r=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    info!(version = VERSION, config = %args.config.display(), "starting open-r");

    let config = match Config::from_file(&args.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            // startup failure names the offending field and reason
            error!(error = %err, "configuration rejected");
            return Err(err.into());
        }
    };

    let neighbor_io = UdpNeighborIo::bind(config.spark().neighbor_discovery_port as u16)
        .await
        .context("binding neighbor discovery socket")?;

    // kernel programming is a separate agent; standalone runs log routes
    let agent = Arc::new(LoggingPlatform);

    let daemon = Daemon::spawn(Arc::clone(&config), agent, neighbor_io).await?;
    let shutdown = daemon.shutdown_signal();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        _ = wait_for_internal_shutdown(shutdown.subscribe()) => {
            info!("internal shutdown requested");
        }
    }

    daemon.shutdown().await;
    Ok(())
}

async fn wait_for_internal_shutdown(mut rx: tokio::sync::broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}
