//! Modelvault RPC Server - HTTP front-end for model downloads.
//!
//! Paths and installer settings come from the `MODELVAULT_*` environment
//! variables; see `ManagerConfig::from_env`.

mod handlers;
mod server;

use anyhow::Result;
use clap::Parser;
use modelvault_core::{ManagerConfig, ModelDownloader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelvault-rpc")]
#[command(about = "HTTP server for downloading and removing NLP models")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Modelvault RPC Server");

    let config = ManagerConfig::from_env()?;
    info!(
        "Shared directory: {}, isolated storage: {}",
        config.shared_dir.display(),
        config.isolated_dir.display()
    );

    let downloader = ModelDownloader::new(config)?;
    match downloader.audit().await {
        Ok(audit) if !audit.is_clean() => warn!(
            "Isolated storage is out of sync: orphaned {:?}, missing {:?}",
            audit.orphaned, audit.missing
        ),
        Ok(_) => {}
        Err(e) => warn!("Failed to audit isolated storage: {}", e),
    }

    let addr = server::start_server(downloader.clone(), &args.host, args.port).await?;
    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Leave the shared directory as it was before an unfinished download.
    if downloader.is_downloading().await {
        info!("Cancelling download in flight");
        if let Err(e) = downloader.cancel().await {
            warn!("Failed to roll back download on shutdown: {}", e);
        }
    }

    Ok(())
}
