//! Status Reporter
//!
//! Read-only projections over the live builder counters and the rebuild job
//! board, shaped for operators.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use crate::candles::{interval_label, AggregationReport, CandleAggregator};
use crate::error::CandleError;
use crate::markets::MarketMetadataCache;
use crate::rebuild::{RebuildJob, RebuildOrchestrator, RebuildScope, ScopeStatus};
use crate::types::Observation;

/// Counters kept by the live ingestion loop
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveBuilderCounters {
    pub running: bool,
    /// Unix milliseconds
    pub started_at: Option<i64>,
    pub observations: u64,
    pub price_observations: u64,
    pub trade_observations: u64,
    pub candles_created: u64,
    pub candles_flushed: u64,
    pub late_rejected: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    /// Timestamp of the last observation applied without error
    pub last_observation_timestamp: Option<i64>,
}

#[derive(Debug, Default)]
pub struct LiveBuilderStats {
    counters: RwLock<LiveBuilderCounters>,
}

impl LiveBuilderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.running = true;
        counters.started_at = Some(Utc::now().timestamp_millis());
    }

    pub fn mark_stopped(&self) {
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .running = false;
    }

    pub fn record(&self, observation: &Observation, outcome: Result<&AggregationReport, &CandleError>) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.observations += 1;
        match observation {
            Observation::Price(_) => counters.price_observations += 1,
            Observation::Trade(_) => counters.trade_observations += 1,
        }

        match outcome {
            Ok(report) => {
                counters.candles_created += report.created as u64;
                counters.candles_flushed += report.flushed as u64;
                counters.late_rejected += report.late_rejected as u64;
                counters.last_observation_timestamp = Some(observation.timestamp());
            }
            Err(e) => {
                *counters.errors_by_kind.entry(e.kind().to_string()).or_insert(0) += 1;
                counters.last_error = Some(e.to_string());
            }
        }
    }

    /// An applied observation that did not reach the history; later
    /// rebuilds will not see it
    pub fn record_history_error(&self, error: &anyhow::Error) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        *counters.errors_by_kind.entry("history".to_string()).or_insert(0) += 1;
        counters.last_error = Some(format!("history append failed: {:#}", error));
    }

    pub fn snapshot(&self) -> LiveBuilderCounters {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderStatus {
    #[serde(flatten)]
    pub counters: LiveBuilderCounters,
    pub open_candles: usize,
    pub markets: usize,
    pub resources: Vec<String>,
    pub intervals: Vec<String>,
    pub rebuild_in_progress: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStatusReport {
    pub scope: RebuildScope,
    #[serde(flatten)]
    pub status: ScopeStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllBuildersStatus {
    pub builder: BuilderStatus,
    pub rebuilds: Vec<RebuildJob>,
}

pub struct StatusReporter {
    stats: Arc<LiveBuilderStats>,
    live: Arc<AsyncMutex<CandleAggregator>>,
    markets: Arc<MarketMetadataCache>,
    rebuilds: Arc<RebuildOrchestrator>,
}

impl StatusReporter {
    pub fn new(
        stats: Arc<LiveBuilderStats>,
        live: Arc<AsyncMutex<CandleAggregator>>,
        markets: Arc<MarketMetadataCache>,
        rebuilds: Arc<RebuildOrchestrator>,
    ) -> Self {
        Self {
            stats,
            live,
            markets,
            rebuilds,
        }
    }

    pub async fn builder_status(&self) -> BuilderStatus {
        let (open_candles, intervals) = {
            let live = self.live.lock().await;
            (
                live.store().len(),
                live.intervals().iter().map(|i| interval_label(*i)).collect(),
            )
        };

        BuilderStatus {
            counters: self.stats.snapshot(),
            open_candles,
            markets: self.markets.len(),
            resources: self.markets.resource_slugs(),
            intervals,
            rebuild_in_progress: self.rebuilds.has_active_jobs(),
        }
    }

    /// Latest job for a resource, or for full rebuilds when no resource is given
    pub fn rebuild_status(&self, resource_slug: Option<&str>) -> RebuildStatusReport {
        let scope = match resource_slug.map(str::trim).filter(|s| !s.is_empty()) {
            Some(slug) => RebuildScope::Resource(slug.to_string()),
            None => RebuildScope::All,
        };
        RebuildStatusReport {
            status: self.rebuilds.status(&scope),
            scope,
        }
    }

    pub async fn all_builders_status(&self) -> AllBuildersStatus {
        AllBuildersStatus {
            builder: self.builder_status().await,
            rebuilds: self.rebuilds.jobs(),
        }
    }
}
