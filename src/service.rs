//! Candle service
//!
//! Wires the aggregator, rebuild orchestrator and status reporter together and
//! owns the live ingestion loop. Observations arrive on an mpsc channel and are
//! applied one at a time, in arrival order, under the live aggregator lock.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::candles::{normalize_intervals, AggregationReport, CandleAggregator};
use crate::config::AppConfig;
use crate::error::CandleError;
use crate::markets::MarketMetadataCache;
use crate::persistence::{CandleRepository, ObservationHistory};
use crate::rebuild::{OperationResult, RebuildOrchestrator, RebuildScope};
use crate::status::{AllBuildersStatus, BuilderStatus, LiveBuilderStats, RebuildStatusReport, StatusReporter};
use crate::types::{Candle, CandleType, Observation};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub intervals: Vec<i64>,
    pub channel_capacity: usize,
    pub yield_every: usize,
}

impl ServiceOptions {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            intervals: normalize_intervals(&config.engine.intervals)?,
            channel_capacity: config.engine.channel_capacity.max(1),
            yield_every: config.rebuild.yield_every,
        })
    }
}

/// Collaborators shared by the service and its ingestion task
#[derive(Clone)]
struct LivePath {
    live: Arc<AsyncMutex<CandleAggregator>>,
    history: Arc<dyn ObservationHistory>,
    stats: Arc<LiveBuilderStats>,
}

impl LivePath {
    async fn apply(&self, observation: &Observation) -> Result<AggregationReport, CandleError> {
        let mut live = self.live.lock().await;
        let outcome = live.process(observation).await;

        if outcome.is_ok() {
            // appended under the lock so history order matches apply order
            if let Err(e) = self.history.append(observation).await {
                warn!(error = %e, timestamp = observation.timestamp(), "Failed to append observation to history");
                self.stats.record_history_error(&e);
            }
        }
        drop(live);

        self.stats.record(observation, outcome.as_ref());
        if let Err(e) = &outcome {
            if e.is_metadata_inconsistency() {
                warn!(kind = e.kind(), error = %e, timestamp = observation.timestamp(), "Observation does not match market metadata");
            } else {
                error!(kind = e.kind(), error = %e, timestamp = observation.timestamp(), "Failed to apply observation");
            }
        }
        outcome
    }

    async fn run(self, mut receiver: mpsc::Receiver<Observation>, cancel: CancellationToken) {
        self.stats.mark_started();
        info!("Live candle ingestion started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // stop accepting, then apply what is already queued
                    receiver.close();
                    while let Some(observation) = receiver.recv().await {
                        let _ = self.apply(&observation).await;
                    }
                    break;
                }
                next = receiver.recv() => match next {
                    Some(observation) => {
                        let _ = self.apply(&observation).await;
                    }
                    None => break,
                },
            }
        }
        self.stats.mark_stopped();
        info!("Live candle ingestion stopped");
    }
}

pub struct CandleService {
    markets: Arc<MarketMetadataCache>,
    repository: Arc<dyn CandleRepository>,
    live_path: LivePath,
    rebuilds: Arc<RebuildOrchestrator>,
    status: StatusReporter,
    sender: mpsc::Sender<Observation>,
    cancel: CancellationToken,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
}

impl CandleService {
    /// Build the service and spawn the ingestion loop on the current runtime
    pub fn start(
        options: ServiceOptions,
        markets: Arc<MarketMetadataCache>,
        repository: Arc<dyn CandleRepository>,
        history: Arc<dyn ObservationHistory>,
    ) -> Self {
        let live = Arc::new(AsyncMutex::new(CandleAggregator::new(
            Arc::clone(&markets),
            Arc::clone(&repository),
            options.intervals.clone(),
        )));
        let stats = Arc::new(LiveBuilderStats::new());
        let rebuilds = Arc::new(RebuildOrchestrator::new(
            Arc::clone(&markets),
            Arc::clone(&history),
            Arc::clone(&live),
            options.intervals.clone(),
            options.yield_every,
        ));
        let status = StatusReporter::new(
            Arc::clone(&stats),
            Arc::clone(&live),
            Arc::clone(&markets),
            Arc::clone(&rebuilds),
        );

        let live_path = LivePath { live, history, stats };
        let (sender, receiver) = mpsc::channel(options.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(live_path.clone().run(receiver, cancel.clone()));

        Self {
            markets,
            repository,
            live_path,
            rebuilds,
            status,
            sender,
            cancel,
            ingest_task: Mutex::new(Some(task)),
        }
    }

    pub fn markets(&self) -> &Arc<MarketMetadataCache> {
        &self.markets
    }

    /// Feed handle for observation producers
    pub fn sender(&self) -> mpsc::Sender<Observation> {
        self.sender.clone()
    }

    /// Queue an observation for the live loop
    pub async fn submit(&self, observation: Observation) -> Result<()> {
        self.sender
            .send(observation)
            .await
            .context("Live ingestion loop is not running")
    }

    /// Apply an observation immediately, bypassing the queue
    pub async fn ingest(&self, observation: &Observation) -> Result<AggregationReport, CandleError> {
        self.live_path.apply(observation).await
    }

    /// Restore open candles from the repository
    pub async fn warm_start(&self) -> Result<usize> {
        let restored = self.live_path.live.lock().await.warm_start().await?;
        info!(restored, "Open candles restored from repository");
        Ok(restored)
    }

    /// Persist every open candle
    pub async fn flush(&self) -> Result<usize> {
        let flushed = self.live_path.live.lock().await.flush_all().await?;
        debug!(flushed, "Open candles flushed");
        Ok(flushed)
    }

    pub fn start_rebuild_all(&self) -> OperationResult {
        self.rebuilds.start_rebuild_all()
    }

    pub fn start_rebuild_resource(&self, resource_slug: &str) -> OperationResult {
        self.rebuilds.start_rebuild_resource(resource_slug)
    }

    pub fn cancel_rebuild(&self, resource_slug: Option<&str>) -> OperationResult {
        let scope = match resource_slug {
            Some(slug) => RebuildScope::Resource(slug.to_string()),
            None => RebuildScope::All,
        };
        self.rebuilds.cancel(&scope)
    }

    pub fn rebuilds(&self) -> &Arc<RebuildOrchestrator> {
        &self.rebuilds
    }

    pub async fn builder_status(&self) -> BuilderStatus {
        self.status.builder_status().await
    }

    pub fn rebuild_status(&self, resource_slug: Option<&str>) -> RebuildStatusReport {
        self.status.rebuild_status(resource_slug)
    }

    pub async fn all_builders_status(&self) -> AllBuildersStatus {
        self.status.all_builders_status().await
    }

    /// Persisted candles of a series plus the open candle, ascending
    pub async fn candles(&self, candle_type: CandleType, interval: i64, market_index: u64) -> Result<Vec<Candle>> {
        let mut candles = self
            .repository
            .list(candle_type, interval, market_index)
            .await
            .context("Failed to list candles")?;

        let open = self
            .live_path
            .live
            .lock()
            .await
            .open_candle(candle_type, market_index, interval)
            .cloned();
        if let Some(open) = open {
            match candles.iter_mut().find(|c| c.timestamp == open.timestamp) {
                Some(row) => row.assign_values(&open),
                None => candles.push(open),
            }
            candles.sort_by_key(|c| c.timestamp);
        }
        Ok(candles)
    }

    /// Stop rebuilds and ingestion, then flush open candles
    pub async fn shutdown(&self) -> Result<usize> {
        self.rebuilds.shutdown().await;
        self.cancel.cancel();

        let task = self
            .ingest_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Ingestion task panicked");
            }
        }

        let flushed = self.flush().await?;
        info!(flushed, "Candle service stopped");
        Ok(flushed)
    }
}
