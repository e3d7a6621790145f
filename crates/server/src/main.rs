//! Market data aggregator
//!
//! Main entry point: discovers markets, starts the shard workers and serves
//! normalized book and trade records over WebSocket.

use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aggregator_core::AggregatorSettings;
use aggregator_feed::SourceRegistry;
use aggregator_server::AggregatorSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting market data aggregator v{}", env!("CARGO_PKG_VERSION"));

    let settings = AggregatorSettings::load().context("invalid configuration")?;
    info!(
        "Exchanges {:?}, channels {:?}, {} workers",
        settings.markets.exchanges,
        settings.markets.channels,
        settings.workers.worker_count()
    );

    let http = reqwest::Client::builder()
        .user_agent(concat!("market-data-aggregator/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;
    let sources = SourceRegistry::for_exchanges(&settings.markets.exchanges, &http)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
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
            _ = ctrl_c => {
                info!("Received Ctrl+C");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    let supervisor = AggregatorSupervisor::new(settings, sources);
    info!("Press Ctrl+C to shutdown");

    if let Err(e) = supervisor.run(shutdown_rx).await {
        error!("Aggregator stopped: {:#}", e);
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
