//! Candle persistence
//!
//! `CandleRepository` is the durable store the aggregator writes closed
//! candles through to. Operations are atomic per key; callers never rely on
//! multi-key transactions. The in-memory implementation backs tests, the
//! rebuild scratch path, and single-process deployments.

mod history;

pub use history::{CsvObservationHistory, InMemoryObservationHistory, ObservationHistory};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock as AsyncRwLock;

use crate::types::{Candle, CandleKey, CandleType};

/// Durable candle rows keyed by (type, interval, market, bucket timestamp)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Fetch the row for a key, inserting a blank one if absent.
    /// Repeated calls with the same key return the same row identity.
    async fn get_or_create(
        &self,
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
        resource_slug: &str,
        timestamp: i64,
    ) -> Result<Candle>;

    /// Upsert by key; returns the stored row
    async fn save(&self, candle: Candle) -> Result<Candle>;

    /// Most recent row of a series
    async fn latest(
        &self,
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
    ) -> Result<Option<Candle>>;

    /// Every row of a series, ascending by timestamp
    async fn list(
        &self,
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
    ) -> Result<Vec<Candle>>;
}

#[derive(Debug, Default)]
struct RepositoryState {
    rows: BTreeMap<CandleKey, Candle>,
    next_id: u64,
}

impl RepositoryState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Candle repository kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryCandleRepository {
    state: AsyncRwLock<RepositoryState>,
}

impl InMemoryCandleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row, ordered by key
    pub async fn all(&self) -> Vec<Candle> {
        self.state.read().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn series_range(candle_type: CandleType, interval: i64, market_index: u64) -> std::ops::RangeInclusive<CandleKey> {
    let key = |timestamp| CandleKey {
        candle_type,
        interval,
        market_index,
        timestamp,
    };
    key(i64::MIN)..=key(i64::MAX)
}

#[async_trait]
impl CandleRepository for InMemoryCandleRepository {
    async fn get_or_create(
        &self,
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
        resource_slug: &str,
        timestamp: i64,
    ) -> Result<Candle> {
        let key = CandleKey {
            candle_type,
            interval,
            market_index,
            timestamp,
        };
        let mut state = self.state.write().await;
        if let Some(existing) = state.rows.get(&key) {
            return Ok(existing.clone());
        }

        let mut row = Candle::blank(candle_type, interval, market_index, resource_slug, timestamp);
        row.id = Some(state.allocate_id());
        state.rows.insert(key, row.clone());
        Ok(row)
    }

    async fn save(&self, candle: Candle) -> Result<Candle> {
        let key = candle.key();
        let mut state = self.state.write().await;
        let id = match state.rows.get(&key).and_then(|existing| existing.id) {
            Some(id) => id,
            None => state.allocate_id(),
        };

        let mut stored = candle;
        stored.id = Some(id);
        state.rows.insert(key, stored.clone());
        Ok(stored)
    }

    async fn latest(
        &self,
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
    ) -> Result<Option<Candle>> {
        let state = self.state.read().await;
        Ok(state
            .rows
            .range(series_range(candle_type, interval, market_index))
            .next_back()
            .map(|(_, candle)| candle.clone()))
    }

    async fn list(
        &self,
        candle_type: CandleType,
        interval: i64,
        market_index: u64,
    ) -> Result<Vec<Candle>> {
        let state = self.state.read().await;
        Ok(state
            .rows
            .range(series_range(candle_type, interval, market_index))
            .map(|(_, candle)| candle.clone())
            .collect())
    }
}
