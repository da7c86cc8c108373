//! Market directory sources and the periodic refresh task

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{MarketGroupRecord, MarketMetadataCache};

/// Source of market-group records
#[async_trait]
pub trait MarketDirectory: Send + Sync {
    /// Source name for logs
    fn name(&self) -> &str;

    /// Fetch the full current directory
    async fn fetch(&self) -> Result<Vec<MarketGroupRecord>>;
}

/// Directory kept in a YAML or JSON file (a list of market groups)
pub struct FileMarketDirectory {
    path: PathBuf,
    name: String,
}

impl FileMarketDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }

    fn parse(&self, raw: &str) -> Result<Vec<MarketGroupRecord>> {
        let extension = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(raw)
                .with_context(|| format!("Failed to parse YAML directory {}", self.path.display())),
            "json" => serde_json::from_str(raw)
                .with_context(|| format!("Failed to parse JSON directory {}", self.path.display())),
            other => bail!(
                "Unsupported market directory extension '{}' for {}",
                other,
                self.path.display()
            ),
        }
    }
}

#[async_trait]
impl MarketDirectory for FileMarketDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<MarketGroupRecord>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read market directory {}", self.path.display()))?;
        self.parse(&raw)
    }
}

/// Refresh the cache now and then every `period` until cancelled
pub fn spawn_refresh_task(
    directory: Arc<dyn MarketDirectory>,
    cache: Arc<MarketMetadataCache>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(source = directory.name(), "Market directory refresh stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match directory.fetch().await {
                        Ok(groups) => {
                            cache.refresh(&groups);
                        }
                        Err(e) => {
                            warn!(source = directory.name(), error = %e, "Market directory refresh failed");
                        }
                    }
                }
            }
        }
    })
}
