//! Typed failures of the aggregation step

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CandleError {
    #[error("market not found: chain {chain_id} address {address} market {market_id}")]
    MarketNotFound {
        chain_id: u64,
        address: String,
        market_id: u64,
    },
    #[error("resource '{0}' has no cached markets")]
    ResourceNotIndexed(String),
    #[error("invalid {field} amount: '{value}'")]
    InvalidAmount { field: &'static str, value: String },
    #[error("{field} sum overflowed 256 bits")]
    AmountOverflow { field: &'static str },
    #[error("timestamp {timestamp} has no {interval}s bucket")]
    InvalidTimestamp { timestamp: i64, interval: i64 },
    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl CandleError {
    /// Stable label used by status counters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MarketNotFound { .. } | Self::ResourceNotIndexed(_) => "metadata",
            Self::InvalidAmount { .. } | Self::AmountOverflow { .. } | Self::InvalidTimestamp { .. } => "parse",
            Self::Persistence(_) => "persistence",
        }
    }

    /// Metadata-cache/ingestion desynchronization that operators must see
    pub fn is_metadata_inconsistency(&self) -> bool {
        self.kind() == "metadata"
    }
}
