use clap::Parser;
use filing_core::{EventBus, FilingProvider};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use filing_local::{build_backend, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting filing-syncd");
    info!("  Provider: {}", config.provider);
    info!("  User: {}", config.effective_user_id());
    info!("  Working dir: {}", config.effective_working_dir().display());

    let events = EventBus::default();
    let event_logger = spawn_event_logger(&events);

    let backend = build_backend(&config, events).await?;
    backend.initialize().await?;

    // One pass up front so the working copy starts current
    match backend.synchronize().await {
        Ok(summary) => info!(
            "Initial synchronization: {} synced, {} skipped, {} failed",
            summary.synced, summary.skipped, summary.failed
        ),
        Err(e) => warn!("Initial synchronization failed: {}", e),
    }

    if backend.start_background().await {
        info!("Background synchronization started");
    }

    let mut shutdown_rx = create_shutdown_signal();
    let _ = shutdown_rx.wait_for(|&v| v).await;

    backend.stop_background().await;
    drop(backend);
    event_logger.abort();

    info!("filing-syncd shutdown complete");
    Ok(())
}

/// Log every filing event as one JSON line.
fn spawn_event_logger(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "filing_events", "{}", json),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, {} events dropped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
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

        let _ = tx.send(true);
    });

    rx
}
