//! Observation history used to replay candles during rebuilds
//!
//! The live ingestion loop appends every observation it accepts; rebuilds read
//! the history back. CSV files are split per UTC day of the observation
//! timestamp, one folder per observation kind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tracing::debug;

use crate::types::{Observation, PriceObservation, TradeObservation};

/// Source-of-truth feed of past observations
#[async_trait]
pub trait ObservationHistory: Send + Sync {
    /// Price observations, optionally limited to one resource, ascending by timestamp
    async fn price_observations(&self, resource_slug: Option<&str>) -> Result<Vec<PriceObservation>>;

    /// All trade observations, ascending by timestamp
    async fn trade_observations(&self) -> Result<Vec<TradeObservation>>;

    /// Record an observation accepted by the live path
    async fn append(&self, observation: &Observation) -> Result<()>;
}

/// History kept in memory
#[derive(Debug, Default)]
pub struct InMemoryObservationHistory {
    prices: AsyncRwLock<Vec<PriceObservation>>,
    trades: AsyncRwLock<Vec<TradeObservation>>,
}

impl InMemoryObservationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observations(observations: impl IntoIterator<Item = Observation>) -> Self {
        let mut prices = Vec::new();
        let mut trades = Vec::new();
        for observation in observations {
            match observation {
                Observation::Price(obs) => prices.push(obs),
                Observation::Trade(obs) => trades.push(obs),
            }
        }
        Self {
            prices: AsyncRwLock::new(prices),
            trades: AsyncRwLock::new(trades),
        }
    }
}

#[async_trait]
impl ObservationHistory for InMemoryObservationHistory {
    async fn price_observations(&self, resource_slug: Option<&str>) -> Result<Vec<PriceObservation>> {
        let mut records: Vec<PriceObservation> = self
            .prices
            .read()
            .await
            .iter()
            .filter(|obs| resource_slug.map_or(true, |slug| obs.resource_slug == slug))
            .cloned()
            .collect();
        records.sort_by_key(|obs| obs.timestamp);
        Ok(records)
    }

    async fn trade_observations(&self) -> Result<Vec<TradeObservation>> {
        let mut records = self.trades.read().await.clone();
        records.sort_by_key(|obs| obs.timestamp);
        Ok(records)
    }

    async fn append(&self, observation: &Observation) -> Result<()> {
        match observation {
            Observation::Price(obs) => self.prices.write().await.push(obs.clone()),
            Observation::Trade(obs) => self.trades.write().await.push(obs.clone()),
        }
        Ok(())
    }
}

const PRICES_FOLDER: &str = "prices";
const TRADES_FOLDER: &str = "trades";

/// Open writer for the most recently used day file
struct DayWriter {
    path: PathBuf,
    writer: csv::Writer<std::fs::File>,
}

/// History stored as daily CSV files
pub struct CsvObservationHistory {
    data_dir: PathBuf,
    price_writer: Mutex<Option<DayWriter>>,
    trade_writer: Mutex<Option<DayWriter>>,
}

impl CsvObservationHistory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join(PRICES_FOLDER)).context("Failed to create prices history directory")?;
        fs::create_dir_all(data_dir.join(TRADES_FOLDER)).context("Failed to create trades history directory")?;
        Ok(Self {
            data_dir,
            price_writer: Mutex::new(None),
            trade_writer: Mutex::new(None),
        })
    }

    fn day_file(&self, folder: &str, timestamp: i64) -> PathBuf {
        let date = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "invalid-date".to_string());
        self.data_dir.join(folder).join(format!("{}_{}.csv", folder, date))
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
        let file_has_data = path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open history file {}", path.display()))?;

        Ok(WriterBuilder::new().has_headers(!file_has_data).from_writer(file))
    }

    async fn write_record<T: serde::Serialize>(
        slot: &Mutex<Option<DayWriter>>,
        path: PathBuf,
        record: &T,
    ) -> Result<()> {
        let mut guard = slot.lock().await;
        let reuse = guard.as_ref().map(|w| w.path == path).unwrap_or(false);
        if !reuse {
            let writer = Self::create_writer(&path)?;
            *guard = Some(DayWriter { path, writer });
        }
        if let Some(day) = guard.as_mut() {
            day.writer
                .serialize(record)
                .context("Failed to write history record")?;
            day.writer.flush().context("Failed to flush history writer")?;
        }
        Ok(())
    }

    /// Read every `<folder>_*.csv` file, oldest day first
    fn load_folder<T: DeserializeOwned>(&self, folder: &str) -> Result<Vec<T>> {
        let dir = self.data_dir.join(folder);
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list history directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open history file {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize() {
                let record: T = result
                    .with_context(|| format!("Failed to deserialize record in {}", path.display()))?;
                records.push(record);
            }
            debug!(file = %path.display(), "Loaded history file");
        }
        Ok(records)
    }
}

#[async_trait]
impl ObservationHistory for CsvObservationHistory {
    async fn price_observations(&self, resource_slug: Option<&str>) -> Result<Vec<PriceObservation>> {
        // hold the writer lock so a half-written row is never read
        let _guard = self.price_writer.lock().await;
        let mut records: Vec<PriceObservation> = self.load_folder(PRICES_FOLDER)?;
        if let Some(slug) = resource_slug {
            records.retain(|obs| obs.resource_slug == slug);
        }
        records.sort_by_key(|obs| obs.timestamp);
        Ok(records)
    }

    async fn trade_observations(&self) -> Result<Vec<TradeObservation>> {
        let _guard = self.trade_writer.lock().await;
        let mut records: Vec<TradeObservation> = self.load_folder(TRADES_FOLDER)?;
        records.sort_by_key(|obs| obs.timestamp);
        Ok(records)
    }

    async fn append(&self, observation: &Observation) -> Result<()> {
        match observation {
            Observation::Price(obs) => {
                let path = self.day_file(PRICES_FOLDER, obs.timestamp);
                Self::write_record(&self.price_writer, path, obs).await
            }
            Observation::Trade(obs) => {
                let path = self.day_file(TRADES_FOLDER, obs.timestamp);
                Self::write_record(&self.trade_writer, path, obs).await
            }
        }
    }
}
