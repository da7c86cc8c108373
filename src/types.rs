//! Core types used throughout the candle cache
//!
//! Defines observations, candles and market metadata records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource slug used for markets whose group has no linked resource
pub const NO_RESOURCE_SLUG: &str = "no-resource";

/// Kind of candle series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleType {
    /// Cumulative weighted average of a resource's fee/usage ratio
    Index,
    /// Trade fill prices of a single market
    MarketPrice,
}

impl CandleType {
    pub const ALL: [CandleType; 2] = [CandleType::Index, CandleType::MarketPrice];

    pub fn as_str(&self) -> &'static str {
        match self {
            CandleType::Index => "index",
            CandleType::MarketPrice => "market_price",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "index" => Some(CandleType::Index),
            "market_price" | "marketprice" | "trade" => Some(CandleType::MarketPrice),
            _ => None,
        }
    }
}

impl fmt::Display for CandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tick of a resource's cost/usage ratio, produced by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceObservation {
    pub resource_slug: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Decimal string
    pub used: String,
    /// Decimal string
    pub fee_paid: String,
}

/// One trade fill on a market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeObservation {
    pub chain_id: u64,
    pub market_group_address: String,
    pub market_id: u64,
    /// Unix seconds
    pub timestamp: i64,
    /// Decimal string
    pub price: String,
}

/// Anything the aggregator can consume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Price(PriceObservation),
    Trade(TradeObservation),
}

impl Observation {
    pub fn timestamp(&self) -> i64 {
        match self {
            Observation::Price(obs) => obs.timestamp,
            Observation::Trade(obs) => obs.timestamp,
        }
    }
}

/// Metadata for one market, as cached from the market directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketInfo {
    pub resource_slug: String,
    pub market_group_index: u64,
    pub market_index: u64,
    /// On-chain market id
    pub market_id: u64,
    pub market_group_address: String,
    pub market_group_chain_id: u64,
    pub start_timestamp: i64,
    /// 0 means open-ended
    pub end_timestamp: i64,
    pub is_cumulative: bool,
}

impl MarketInfo {
    /// Whether the market accepts observations at `timestamp`
    pub fn is_active_at(&self, timestamp: i64) -> bool {
        timestamp >= self.start_timestamp
            && (self.end_timestamp == 0 || timestamp <= self.end_timestamp)
    }
}

/// Durable/runtime candle row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Row identity assigned by the repository; `None` while only in memory
    pub id: Option<u64>,
    pub candle_type: CandleType,
    /// Bucket width in seconds
    pub interval: i64,
    pub market_index: u64,
    pub resource_slug: String,
    /// Bucket start, aligned to `interval`
    pub timestamp: i64,
    pub end_timestamp: i64,
    pub last_updated_timestamp: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub sum_fee_paid: String,
    pub sum_used: String,
    pub market_id: u64,
    pub address: String,
    pub chain_id: u64,
}

impl Candle {
    /// Empty candle for a key, used by repositories when inserting a new row
    pub fn blank(
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
        resource_slug: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            id: None,
            candle_type,
            interval,
            market_index,
            resource_slug: resource_slug.to_string(),
            timestamp,
            end_timestamp: timestamp.saturating_add(interval),
            last_updated_timestamp: timestamp,
            open: "0".to_string(),
            high: "0".to_string(),
            low: "0".to_string(),
            close: "0".to_string(),
            sum_fee_paid: "0".to_string(),
            sum_used: "0".to_string(),
            market_id: 0,
            address: String::new(),
            chain_id: 0,
        }
    }

    pub fn key(&self) -> CandleKey {
        CandleKey {
            candle_type: self.candle_type,
            interval: self.interval,
            market_index: self.market_index,
            timestamp: self.timestamp,
        }
    }

    /// Copy every value column from `other`, keeping this row's identity
    pub fn assign_values(&mut self, other: &Candle) {
        let id = self.id;
        *self = other.clone();
        self.id = id;
    }
}

/// Persistence key of a candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleKey {
    pub candle_type: CandleType,
    pub interval: i64,
    pub market_index: u64,
    pub timestamp: i64,
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}s/market-{}@{}",
            self.candle_type, self.interval, self.market_index, self.timestamp
        )
    }
}
