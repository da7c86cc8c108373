//! Interval and bucket arithmetic

use anyhow::{bail, Result};
use serde::Serialize;

/// Default candle widths in seconds: 5m, 15m, 30m, 1h, 4h, 1d, 7d, 28d
pub const DEFAULT_INTERVALS: [i64; 8] = [300, 900, 1800, 3600, 14_400, 86_400, 604_800, 2_419_200];

/// Half-open time bucket `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub start: i64,
    pub end: i64,
}

impl Bucket {
    /// Bucket containing `timestamp` for an interval of `interval` seconds.
    /// Floors toward negative infinity so pre-epoch timestamps stay aligned.
    /// `None` when either bound falls outside `i64`.
    pub fn containing(timestamp: i64, interval: i64) -> Option<Self> {
        debug_assert!(interval > 0, "interval must be positive");
        let start = timestamp.checked_div_euclid(interval)?.checked_mul(interval)?;
        Some(Self {
            start,
            end: start.checked_add(interval)?,
        })
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

/// Human label for an interval ("5m", "1h", "7d")
pub fn interval_label(interval: i64) -> String {
    const DAY: i64 = 86_400;
    const HOUR: i64 = 3_600;
    const MINUTE: i64 = 60;
    if interval % DAY == 0 {
        format!("{}d", interval / DAY)
    } else if interval % HOUR == 0 {
        format!("{}h", interval / HOUR)
    } else if interval % MINUTE == 0 {
        format!("{}m", interval / MINUTE)
    } else {
        format!("{}s", interval)
    }
}

/// Intervals must be non-empty, positive and unique; returns them sorted
pub fn normalize_intervals(intervals: &[i64]) -> Result<Vec<i64>> {
    if intervals.is_empty() {
        bail!("at least one candle interval must be configured");
    }
    if let Some(bad) = intervals.iter().find(|i| **i <= 0) {
        bail!("candle interval must be positive, got {}", bad);
    }
    let mut sorted = intervals.to_vec();
    sorted.sort_unstable();
    let before = sorted.len();
    sorted.dedup();
    if sorted.len() != before {
        bail!("candle intervals must be unique: {:?}", intervals);
    }
    Ok(sorted)
}
