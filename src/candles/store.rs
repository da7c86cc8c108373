//! Runtime candle store
//!
//! Holds the currently-open candle per (candle type, market, interval) so the
//! hot path avoids a storage round-trip on every observation. One slot per
//! active market × configured interval, kept for the process lifetime.

use std::collections::HashMap;

use crate::types::{Candle, CandleType};

type SlotKey = (CandleType, u64, i64);

/// Open candles, one slot per (candle type, market index, interval)
#[derive(Debug, Default, Clone)]
pub struct RuntimeCandleStore {
    slots: HashMap<SlotKey, Candle>,
}

impl RuntimeCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, candle_type: CandleType, market_index: u64, interval: i64) -> Option<&Candle> {
        self.slots.get(&(candle_type, market_index, interval))
    }

    /// Overwrite the slot unconditionally
    pub fn set(&mut self, candle_type: CandleType, market_index: u64, interval: i64, candle: Candle) {
        self.slots.insert((candle_type, market_index, interval), candle);
    }

    /// Empty the slot; the series stops until the market is active again
    pub fn clear(&mut self, candle_type: CandleType, market_index: u64, interval: i64) -> Option<Candle> {
        self.slots.remove(&(candle_type, market_index, interval))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copy of every open candle, ordered by key
    pub fn snapshot(&self) -> Vec<Candle> {
        let mut candles: Vec<Candle> = self.slots.values().cloned().collect();
        candles.sort_by_key(|c| c.key());
        candles
    }
}
