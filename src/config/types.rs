//! Configuration sections

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Candle widths in seconds
    pub intervals: Vec<i64>,
    /// Capacity of the live observation channel
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsConfig {
    /// YAML or JSON market directory file
    pub directory_path: String,
    /// Directory refresh period in seconds
    pub refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebuildConfig {
    /// Folder holding the observation history CSV files
    pub history_dir: String,
    /// Replay yields to the runtime after this many observations
    pub yield_every: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter used when RUST_LOG is unset
    pub level: String,
}
