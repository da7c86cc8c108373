//! Candle cache service binary

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use candle_cache::config::{AppConfig, LoggingConfig};
use candle_cache::markets::{spawn_refresh_task, FileMarketDirectory, MarketDirectory, MarketMetadataCache};
use candle_cache::persistence::{CandleRepository, CsvObservationHistory, InMemoryCandleRepository, ObservationHistory};
use candle_cache::{CandleService, ServiceOptions};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging);
    config.validate()?;
    info!(config = %config, "Starting candle cache");

    // Market metadata must be loaded before open candles are restored
    let markets = Arc::new(MarketMetadataCache::new());
    let directory: Arc<dyn MarketDirectory> = Arc::new(FileMarketDirectory::new(&config.markets.directory_path));
    match directory.fetch().await {
        Ok(groups) => {
            let summary = markets.refresh(&groups);
            info!(markets = markets.len(), inserted = summary.inserted, "Market directory loaded");
        }
        Err(e) => warn!(error = ?e, "Initial market directory load failed"),
    }

    let shutdown = CancellationToken::new();
    let refresh_task = spawn_refresh_task(
        Arc::clone(&directory),
        Arc::clone(&markets),
        Duration::from_secs(config.markets.refresh_secs),
        shutdown.clone(),
    );

    let repository: Arc<dyn CandleRepository> = Arc::new(InMemoryCandleRepository::new());
    let history: Arc<dyn ObservationHistory> = Arc::new(
        CsvObservationHistory::new(&config.rebuild.history_dir).context("Failed to open observation history")?,
    );

    let service = Arc::new(CandleService::start(
        ServiceOptions::from_config(&config)?,
        markets,
        repository,
        history,
    ));
    service.warm_start().await?;

    #[cfg(feature = "api")]
    let api_task = if config.api.enabled {
        let addr = config
            .api
            .bind_address
            .parse()
            .with_context(|| format!("Invalid api.bind_address '{}'", config.api.bind_address))?;
        Some(tokio::spawn(candle_cache::api::serve(
            Arc::clone(&service),
            addr,
            shutdown.clone(),
        )))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    shutdown.cancel();

    #[cfg(feature = "api")]
    {
        if let Some(task) = api_task {
            match task.await {
                Ok(Err(e)) => warn!(error = ?e, "API server exited with error"),
                Err(e) => warn!(error = %e, "API task panicked"),
                Ok(Ok(())) => {}
            }
        }
    }

    if let Err(e) = refresh_task.await {
        warn!(error = %e, "Market refresh task panicked");
    }

    let flushed = service.shutdown().await?;
    info!(flushed, "Candle cache stopped");
    Ok(())
}
