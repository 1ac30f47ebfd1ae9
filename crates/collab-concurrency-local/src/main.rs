mod config;
mod replay;

use std::sync::Arc;

use clap::Parser;
use collab_concurrency_local::{ConcurrencyControlService, MemoryRecordStore};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, the report to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let settings = config.settings()?;

    info!("Starting collab-concurrency-local replay");
    info!("  Operations: {}", config.operations.display());
    info!("  Mode: {}", config.mode);
    info!("  Lock timeout: {:?}", settings.lock_timeout);
    info!("  Conflict window: {:?}", settings.conflict_window);
    info!(
        "  Cleanup: every {:?}, retention {:?}",
        settings.cleanup_interval, settings.operation_retention
    );

    let operations = replay::load_operations(&config.operations).await?;

    let service = Arc::new(ConcurrencyControlService::in_memory(settings));
    let store = MemoryRecordStore::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = Arc::clone(&service).start_cleanup_task(shutdown_rx);

    let report = tokio::select! {
        report = replay::replay(&service, &store, operations, config.mode) => Some(report),
        _ = shutdown_signal() => None,
    };

    let _ = shutdown_tx.send(true);
    cleanup.await?;

    match report {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("Replay complete");
        }
        None => warn!("Replay interrupted, no report written"),
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
