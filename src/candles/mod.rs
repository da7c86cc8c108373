//! Candle building
//!
//! Bucket arithmetic, price math, the open-candle store and the aggregator
//! that ties them to the market cache and the repository.

pub mod aggregator;
pub mod interval;
pub mod pricing;
pub mod store;

pub use aggregator::{AggregationReport, CandleAggregator, SlotAction};
pub use interval::{interval_label, normalize_intervals, Bucket, DEFAULT_INTERVALS};
pub use store::RuntimeCandleStore;
