use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use playsync::{Config, Daemon, SyncContext};

/// Two-way playlist sync between Spotify and an ontology platform.
#[derive(Debug, Parser)]
#[command(name = "playsync", version, about)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, env = "PLAYSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Do not write now-playing rows to platform streams
    #[arg(long, env = "PLAYSYNC_NO_INGEST")]
    no_ingest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playsync=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if args.no_ingest {
        config.ingest.enabled = false;
    }
    config.validate()?;

    let ctx = SyncContext::from_config(config).context("Failed to initialize clients")?;
    let daemon = Daemon::start(&ctx);

    if let Err(e) = wait_for_shutdown().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
    daemon.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
