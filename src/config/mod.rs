//! Configuration management for the candle cache
//!
//! Loads from YAML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::candles::{interval_label, normalize_intervals, DEFAULT_INTERVALS};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub markets: MarketsConfig,
    pub rebuild: RebuildConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CANDLES__*)
            .add_source(
                Environment::with_prefix("CANDLES")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("engine.intervals")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load defaults overlaid with a single file, without environment overrides
    pub fn load_from_file(path: &str) -> Result<Self> {
        Self::defaults()?
            .add_source(File::with_name(path))
            .build()
            .with_context(|| format!("Failed to build configuration from {}", path))?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            // Engine defaults
            .set_default("engine.intervals", DEFAULT_INTERVALS.to_vec())?
            .set_default("engine.channel_capacity", 10_000)?
            // Market directory defaults
            .set_default("markets.directory_path", "./config/markets.yaml")?
            .set_default("markets.refresh_secs", 60)?
            // Rebuild defaults
            .set_default("rebuild.history_dir", "./data/history")?
            .set_default("rebuild.yield_every", 1_000)?
            // API defaults
            .set_default("api.enabled", true)?
            .set_default("api.bind_address", "0.0.0.0:3030")?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.level", "info")?;
        Ok(builder)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        normalize_intervals(&self.engine.intervals).context("Invalid engine.intervals")?;
        if self.engine.channel_capacity == 0 {
            bail!("engine.channel_capacity must be greater than zero");
        }
        if self.markets.refresh_secs == 0 {
            bail!("markets.refresh_secs must be greater than zero");
        }
        if self.rebuild.yield_every == 0 {
            bail!("rebuild.yield_every must be greater than zero");
        }
        if self.api.enabled && self.api.bind_address.trim().is_empty() {
            bail!("api.bind_address must be set when the API is enabled");
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        let intervals: Vec<String> = self.engine.intervals.iter().map(|i| interval_label(*i)).collect();
        format!(
            "intervals={:?} directory={} refresh={}s history={} api={}",
            intervals,
            self.markets.directory_path,
            self.markets.refresh_secs,
            self.rebuild.history_dir,
            if self.api.enabled {
                self.api.bind_address.as_str()
            } else {
                "off"
            }
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
