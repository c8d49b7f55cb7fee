//! Skiff daemon: serves the sync gateway over an in-memory scheduler.
//!
//! Batch files dropped into the storage directory become downloads, and
//! every connected client sees them appear. `RUST_LOG` controls verbosity.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use skiff_sync::{BearerToken, FsProbe, Hub, MemoryScheduler, StorageMonitor, SyncServer};
use tokio_util::sync::CancellationToken;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "skiff-daemon")]
#[command(about = "Real-time state sync server for the skiff download manager")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `server.bind_addr`
    #[arg(short, long)]
    bind: Option<String>,

    /// Download directory to watch, overrides `storage.path`
    #[arg(short, long)]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_overrides(args.bind, args.storage);

    info!("Starting skiff daemon...");

    let (scheduler, events) = MemoryScheduler::new();
    let links = scheduler.link_store(Vec::new());
    let hub = Arc::new(Hub::new(Arc::new(scheduler), Arc::new(links)));

    let cancel = CancellationToken::new();

    let forwarder = tokio::spawn(hub.clone().forward_events(events, cancel.child_token()));
    let sampler = tokio::spawn(
        hub.clone()
            .sample_bandwidth(config.bandwidth_interval(), cancel.child_token()),
    );

    let storage_config = config.storage_config();
    info!(
        "Watching {} for *.{} batch files",
        storage_config.path.display(),
        storage_config.extension
    );
    let monitor = Arc::new(StorageMonitor::new(hub.clone(), storage_config, Arc::new(FsProbe)));
    let storage = tokio::spawn(monitor.run(cancel.child_token()));

    let server = match &config.auth.token {
        Some(token) => SyncServer::with_identity(
            config.server_config(),
            hub.clone(),
            Arc::new(BearerToken::new(token.clone())),
        ),
        None => {
            warn!("No auth token configured, accepting every client");
            SyncServer::new(config.server_config(), hub.clone())
        }
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let result = server.run(cancel.clone()).await;
    cancel.cancel();

    let _ = forwarder.await;
    let _ = sampler.await;
    match storage.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Storage monitor stopped: {}", e),
        Err(e) => error!("Storage monitor task failed: {}", e),
    }

    let stats = server.stats();
    info!(
        "Served {} connections, {} frames, {} policy violations",
        stats.total_connections, stats.frames_received, stats.policy_violations
    );

    result
}
