use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crypto_tracker::api::{AppState, app_router};
use crypto_tracker::config::Config;
use crypto_tracker::market_data::adapters::QuoteFetcher;
use crypto_tracker::market_data::adapters::coingecko::CoinGeckoFetcher;
use crypto_tracker::metrics::prometheus;
use crypto_tracker::refresh::coordinator::RefreshCoordinator;
use crypto_tracker::refresh::scheduler::start_refresh_scheduler;
use crypto_tracker::state::snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn open_store(config: &Config) -> Result<Arc<dyn SnapshotStore>> {
    match &config.snapshot_path {
        Some(path) => {
            let store = FileSnapshotStore::open(path)
                .await
                .with_context(|| format!("failed to open snapshot store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("SNAPSHOT_PATH is empty, snapshots will not survive a restart");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("received Ctrl-C, shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    if let Some(addr) = config.metrics_addr {
        prometheus::init_metrics_server(addr)?;
        info!(%addr, "metrics exporter listening");
    }

    info!("crypto-tracker starting");

    let store = open_store(&config).await?;
    let fetcher: Arc<dyn QuoteFetcher> = Arc::new(CoinGeckoFetcher::new(config.coingecko())?);
    let coordinator = RefreshCoordinator::new(fetcher, store, config.fetch_timeout);

    let scheduler = start_refresh_scheduler(coordinator.clone(), config.refresh_interval);

    let router = app_router(
        AppState::new(coordinator, config.refresh_interval),
        &config.cors_allow,
    );
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    served.context("http server failed")?;

    Ok(())
}
