//! Candle Cache Library
//!
//! Streaming OHLC candle engine with isolated historical rebuilds

pub mod candles;
pub mod config;
pub mod error;
pub mod markets;
pub mod persistence;
pub mod rebuild;
pub mod service;
pub mod status;
pub mod types;

#[cfg(feature = "api")]
pub mod api;

pub use candles::{AggregationReport, CandleAggregator};
pub use error::CandleError;
pub use service::{CandleService, ServiceOptions};
