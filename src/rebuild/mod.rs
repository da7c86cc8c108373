//! Rebuild Orchestrator
//!
//! Regenerates candles from the observation history without disturbing the
//! live path. Each job replays into a scratch aggregator with its own open
//! candle store and a private in-memory repository, then publishes the result
//! to the shared repository while holding the live aggregator lock. Jobs run
//! as background tasks; callers get an `OperationResult` immediately and
//! follow progress through the status projections.

mod job;

pub use job::{JobProgress, JobState, OperationResult, RebuildJob, RebuildScope};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::candles::CandleAggregator;
use crate::markets::MarketMetadataCache;
use crate::persistence::{InMemoryCandleRepository, ObservationHistory};
use crate::types::Observation;

/// Failure reason recorded for cancelled jobs
pub const CANCELLED: &str = "cancelled";

/// Status of one scope: the last job that started plus any job still queued
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeStatus {
    pub current: Option<RebuildJob>,
    pub pending: Option<RebuildJob>,
}

#[derive(Debug, Default)]
struct JobBoard {
    /// Latest job per scope that has left the pending state
    current: HashMap<RebuildScope, RebuildJob>,
    pending: HashMap<RebuildScope, RebuildJob>,
}

impl JobBoard {
    fn active_scopes(&self) -> impl Iterator<Item = (&RebuildScope, Uuid)> {
        self.pending
            .iter()
            .map(|(scope, job)| (scope, job.id))
            .chain(
                self.current
                    .iter()
                    .filter(|(_, job)| job.state.is_active())
                    .map(|(scope, job)| (scope, job.id)),
            )
    }

    fn blocking(&self, scope: &RebuildScope) -> Option<(RebuildScope, Uuid)> {
        self.active_scopes()
            .find(|(active, _)| active.overlaps(scope))
            .map(|(active, id)| (active.clone(), id))
    }

    /// Move a pending job to running; it now supersedes the previous record
    fn begin(&mut self, scope: &RebuildScope, id: Uuid) {
        if self.pending.get(scope).map(|job| job.id) != Some(id) {
            return;
        }
        if let Some(mut job) = self.pending.remove(scope) {
            job.start();
            self.current.insert(scope.clone(), job);
        }
    }

    fn update(&mut self, scope: &RebuildScope, id: Uuid, apply: impl FnOnce(&mut RebuildJob)) {
        if let Some(job) = self.current.get_mut(scope).filter(|job| job.id == id) {
            apply(job);
        }
    }
}

/// Cancellation handle and task of a job that has not been joined yet
struct JobHandle {
    scope: RebuildScope,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Shared collaborators handed to every job
#[derive(Clone)]
struct RebuildContext {
    markets: Arc<MarketMetadataCache>,
    history: Arc<dyn ObservationHistory>,
    live: Arc<AsyncMutex<CandleAggregator>>,
    intervals: Vec<i64>,
    yield_every: usize,
    board: Arc<RwLock<JobBoard>>,
}

pub struct RebuildOrchestrator {
    context: RebuildContext,
    handles: Mutex<HashMap<Uuid, JobHandle>>,
}

impl RebuildOrchestrator {
    pub fn new(
        markets: Arc<MarketMetadataCache>,
        history: Arc<dyn ObservationHistory>,
        live: Arc<AsyncMutex<CandleAggregator>>,
        intervals: Vec<i64>,
        yield_every: usize,
    ) -> Self {
        Self {
            context: RebuildContext {
                markets,
                history,
                live,
                intervals,
                yield_every: yield_every.max(1),
                board: Arc::new(RwLock::new(JobBoard::default())),
            },
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_rebuild_all(&self) -> OperationResult {
        self.start(RebuildScope::All)
    }

    pub fn start_rebuild_resource(&self, resource_slug: &str) -> OperationResult {
        let slug = resource_slug.trim();
        if slug.is_empty() {
            return OperationResult::rejected("resource slug must not be empty");
        }
        if self.context.markets.all_indexes_for_resource(slug).is_empty() {
            return OperationResult::rejected(format!("resource '{}' has no cached markets", slug));
        }
        self.start(RebuildScope::Resource(slug.to_string()))
    }

    fn start(&self, scope: RebuildScope) -> OperationResult {
        let job = {
            let mut board = self.context.board.write().unwrap_or_else(PoisonError::into_inner);
            if let Some((active, id)) = board.blocking(&scope) {
                warn!(requested = %scope, blocking = %active, job_id = %id, "Rebuild rejected, overlapping job active");
                return OperationResult::rejected(format!(
                    "rebuild {} overlaps active job {} ({})",
                    scope, id, active
                ));
            }
            let job = RebuildJob::new(scope.clone());
            board.pending.insert(scope.clone(), job.clone());
            job
        };

        let cancel = CancellationToken::new();
        let run = RebuildRun {
            context: self.context.clone(),
            job_id: job.id,
            scope: scope.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute());

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|_, handle| !handle.task.is_finished());
        handles.insert(job.id, JobHandle { scope: scope.clone(), cancel, task });
        drop(handles);

        info!(job_id = %job.id, scope = %scope, "Rebuild queued");
        OperationResult::accepted(format!("rebuild {} started", scope), job.id)
    }

    /// Cancel the active job of exactly this scope
    pub fn cancel(&self, scope: &RebuildScope) -> OperationResult {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let target = handles
            .iter()
            .find(|(_, handle)| &handle.scope == scope && !handle.task.is_finished());

        match target {
            Some((id, handle)) => {
                handle.cancel.cancel();
                info!(job_id = %id, scope = %scope, "Rebuild cancellation requested");
                OperationResult::accepted(format!("rebuild {} cancelling", scope), *id)
            }
            None => OperationResult::rejected(format!("no active rebuild for {}", scope)),
        }
    }

    /// Wait for a job's task to end and return its final record
    pub async fn join(&self, job_id: Uuid) -> Option<RebuildJob> {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.task.await {
                error!(job_id = %job_id, error = %e, "Rebuild task panicked");
            }
        }
        self.job(job_id)
    }

    /// Cancel every job and wait for the tasks to stop
    pub async fn shutdown(&self) {
        let handles: Vec<(Uuid, JobHandle)> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                error!(job_id = %id, error = %e, "Rebuild task panicked");
            }
        }
    }

    pub fn job(&self, job_id: Uuid) -> Option<RebuildJob> {
        let board = self.context.board.read().unwrap_or_else(PoisonError::into_inner);
        board
            .current
            .values()
            .chain(board.pending.values())
            .find(|job| job.id == job_id)
            .cloned()
    }

    pub fn status(&self, scope: &RebuildScope) -> ScopeStatus {
        let board = self.context.board.read().unwrap_or_else(PoisonError::into_inner);
        ScopeStatus {
            current: board.current.get(scope).cloned(),
            pending: board.pending.get(scope).cloned(),
        }
    }

    /// Every known job record, oldest first
    pub fn jobs(&self) -> Vec<RebuildJob> {
        let board = self.context.board.read().unwrap_or_else(PoisonError::into_inner);
        let mut jobs: Vec<RebuildJob> = board
            .current
            .values()
            .chain(board.pending.values())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }

    pub fn has_active_jobs(&self) -> bool {
        let board = self.context.board.read().unwrap_or_else(PoisonError::into_inner);
        let active = board.active_scopes().next().is_some();
        active
    }
}

enum ReplayOutcome {
    Published(JobProgress),
    Rejected { progress: JobProgress, reason: String },
    Cancelled,
}

/// One job's background task
struct RebuildRun {
    context: RebuildContext,
    job_id: Uuid,
    scope: RebuildScope,
    cancel: CancellationToken,
}

impl RebuildRun {
    async fn execute(self) {
        self.with_board(|board| board.begin(&self.scope, self.job_id));
        info!(job_id = %self.job_id, scope = %self.scope, "Rebuild running");

        let outcome = if self.cancel.is_cancelled() {
            Ok(ReplayOutcome::Cancelled)
        } else {
            self.replay().await
        };

        match outcome {
            Ok(ReplayOutcome::Published(progress)) => {
                let message = format!(
                    "replayed {} observations, published {} candles ({} late)",
                    progress.processed, progress.candles_published, progress.late_rejected
                );
                info!(job_id = %self.job_id, scope = %self.scope, %message, "Rebuild completed");
                self.update(|job| {
                    job.progress = progress;
                    job.complete(message);
                });
            }
            Ok(ReplayOutcome::Rejected { progress, reason }) => {
                error!(job_id = %self.job_id, scope = %self.scope, error = %reason, "Rebuild failed, nothing published");
                self.update(|job| {
                    job.progress = progress;
                    job.fail(reason);
                });
            }
            Ok(ReplayOutcome::Cancelled) => {
                warn!(job_id = %self.job_id, scope = %self.scope, "Rebuild cancelled, nothing published");
                self.update(|job| job.fail(CANCELLED));
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(job_id = %self.job_id, scope = %self.scope, error = %reason, "Rebuild failed");
                self.update(|job| job.fail(reason));
            }
        }
    }

    async fn replay(&self) -> Result<ReplayOutcome> {
        let observations = self.load_observations().await?;
        let mut progress = JobProgress {
            total: observations.len(),
            ..JobProgress::default()
        };
        self.update(|job| job.progress = progress);

        let scratch_repository = Arc::new(InMemoryCandleRepository::new());
        let mut scratch = CandleAggregator::new(
            Arc::clone(&self.context.markets),
            scratch_repository.clone(),
            self.context.intervals.clone(),
        );

        let mut first_error: Option<String> = None;
        for observation in &observations {
            if self.cancel.is_cancelled() {
                return Ok(ReplayOutcome::Cancelled);
            }
            match scratch.process(observation).await {
                Ok(report) => progress.late_rejected += report.late_rejected,
                Err(e) => {
                    progress.errors += 1;
                    warn!(
                        job_id = %self.job_id,
                        kind = e.kind(),
                        error = %e,
                        timestamp = observation.timestamp(),
                        "Replay rejected observation"
                    );
                    first_error.get_or_insert_with(|| format!("{} error at {}: {}", e.kind(), observation.timestamp(), e));
                }
            }
            progress.processed += 1;

            if progress.processed % self.context.yield_every == 0 {
                self.update(|job| job.progress = progress);
                tokio::task::yield_now().await;
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(ReplayOutcome::Cancelled);
        }
        if let Some(first) = first_error {
            let reason = format!(
                "replay rejected {} of {} observations, first: {}",
                progress.errors, progress.processed, first
            );
            return Ok(ReplayOutcome::Rejected { progress, reason });
        }

        progress.candles_published = self.publish(&scratch, &scratch_repository).await?;
        Ok(ReplayOutcome::Published(progress))
    }

    /// History in replay order; trades are scoped through the market cache
    async fn load_observations(&self) -> Result<Vec<Observation>> {
        let history = &self.context.history;
        let prices = history
            .price_observations(self.scope.resource())
            .await
            .context("Failed to load price history")?;
        let trades = history
            .trade_observations()
            .await
            .context("Failed to load trade history")?;

        let markets = &self.context.markets;
        let trades = trades.into_iter().filter(|trade| match self.scope.resource() {
            None => true,
            Some(slug) => markets
                .get_by_chain_and_address(trade.chain_id, &trade.market_group_address, trade.market_id)
                .map(|market| market.resource_slug == slug)
                .unwrap_or(false),
        });

        let mut observations: Vec<Observation> = prices
            .into_iter()
            .map(Observation::Price)
            .chain(trades.map(Observation::Trade))
            .collect();
        // stable: equal timestamps keep history order
        observations.sort_by_key(|obs| obs.timestamp());

        debug!(job_id = %self.job_id, count = observations.len(), "Loaded replay history");
        Ok(observations)
    }

    /// Copy scratch results into the shared repository and live store.
    ///
    /// The live slot keeps its candle when it is on the same or a later
    /// bucket than the scratch open candle: it has applied everything in the
    /// history snapshot plus whatever arrived while the replay ran.
    async fn publish(&self, scratch: &CandleAggregator, closed: &InMemoryCandleRepository) -> Result<usize> {
        let mut live = self.context.live.lock().await;
        let mut published = 0;

        for candle in closed.all().await {
            live.write_through(&candle)
                .await
                .with_context(|| format!("Failed to publish candle {}", candle.key()))?;
            published += 1;
        }

        for candle in scratch.store().snapshot() {
            if !live.can_adopt(&candle) {
                debug!(job_id = %self.job_id, candle = %candle.key(), "Live slot already at or past rebuilt bucket");
                continue;
            }
            live.write_through(&candle)
                .await
                .with_context(|| format!("Failed to publish open candle {}", candle.key()))?;
            published += 1;
            live.adopt_open_candle(candle);
        }

        Ok(published)
    }

    fn with_board(&self, apply: impl FnOnce(&mut JobBoard)) {
        let mut board = self.context.board.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut board);
    }

    fn update(&self, apply: impl FnOnce(&mut RebuildJob)) {
        self.with_board(|board| board.update(&self.scope, self.job_id, apply));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markets::{MarketGroupRecord, MarketRecord};
    use crate::persistence::{CandleRepository, InMemoryObservationHistory};
    use crate::types::{CandleType, PriceObservation, TradeObservation};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn markets() -> Arc<MarketMetadataCache> {
        let cache = MarketMetadataCache::new();
        cache.refresh(&[
            MarketGroupRecord {
                index: 1,
                address: "0xgas".to_string(),
                chain_id: 8453,
                resource_slug: Some("gas".to_string()),
                is_cumulative: false,
                markets: vec![MarketRecord {
                    index: 1,
                    market_id: 1,
                    start_timestamp: 0,
                    end_timestamp: 0,
                }],
            },
            MarketGroupRecord {
                index: 2,
                address: "0xblobs".to_string(),
                chain_id: 8453,
                resource_slug: Some("blobs".to_string()),
                is_cumulative: false,
                markets: vec![MarketRecord {
                    index: 2,
                    market_id: 1,
                    start_timestamp: 0,
                    end_timestamp: 0,
                }],
            },
        ]);
        Arc::new(cache)
    }

    fn price(slug: &str, timestamp: i64) -> Observation {
        priced(slug, timestamp, "100", "150")
    }

    fn priced(slug: &str, timestamp: i64, used: &str, fee_paid: &str) -> Observation {
        Observation::Price(PriceObservation {
            resource_slug: slug.to_string(),
            timestamp,
            used: used.to_string(),
            fee_paid: fee_paid.to_string(),
        })
    }

    /// History that takes its snapshot, then waits to be released
    struct GatedHistory {
        inner: InMemoryObservationHistory,
        loaded: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ObservationHistory for GatedHistory {
        async fn price_observations(&self, resource_slug: Option<&str>) -> Result<Vec<PriceObservation>> {
            let snapshot = self.inner.price_observations(resource_slug).await?;
            self.loaded.notify_one();
            self.release.notified().await;
            Ok(snapshot)
        }

        async fn trade_observations(&self) -> Result<Vec<TradeObservation>> {
            self.inner.trade_observations().await
        }

        async fn append(&self, observation: &Observation) -> Result<()> {
            self.inner.append(observation).await
        }
    }

    fn orchestrator(history: Vec<Observation>) -> (RebuildOrchestrator, Arc<InMemoryCandleRepository>) {
        let markets = markets();
        let repository = Arc::new(InMemoryCandleRepository::new());
        let live = Arc::new(AsyncMutex::new(CandleAggregator::new(
            Arc::clone(&markets),
            repository.clone(),
            vec![60],
        )));
        let history = Arc::new(InMemoryObservationHistory::with_observations(history));
        (RebuildOrchestrator::new(markets, history, live, vec![60], 2), repository)
    }

    #[tokio::test]
    async fn overlapping_requests_are_rejected_while_pending() {
        let (orchestrator, _) = orchestrator(vec![price("gas", 10)]);

        let first = orchestrator.start_rebuild_all();
        assert!(first.success);
        // the spawned task has not run yet on the current-thread runtime
        let blocked = orchestrator.start_rebuild_resource("gas");
        assert!(!blocked.success);
        assert!(blocked.message.contains("overlaps"), "{}", blocked.message);
        assert!(!orchestrator.start_rebuild_all().success);

        let job = orchestrator.join(first.job_id.unwrap()).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(orchestrator.start_rebuild_resource("gas").success);
    }

    #[tokio::test]
    async fn different_resources_may_run_together() {
        let (orchestrator, _) = orchestrator(vec![price("gas", 10), price("blobs", 10)]);
        let gas = orchestrator.start_rebuild_resource("gas");
        let blobs = orchestrator.start_rebuild_resource("blobs");
        assert!(gas.success && blobs.success);
        assert!(!orchestrator.start_rebuild_all().success);
        assert!(orchestrator.has_active_jobs());

        orchestrator.join(gas.job_id.unwrap()).await;
        orchestrator.join(blobs.job_id.unwrap()).await;
        assert!(!orchestrator.has_active_jobs());
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected() {
        let (orchestrator, _) = orchestrator(vec![]);
        assert!(!orchestrator.start_rebuild_resource("nope").success);
        assert!(!orchestrator.start_rebuild_resource("  ").success);
        assert!(orchestrator.jobs().is_empty());
    }

    #[tokio::test]
    async fn resource_rebuild_publishes_only_its_markets() {
        let (orchestrator, repository) = orchestrator(vec![
            price("gas", 10),
            price("gas", 70),
            price("blobs", 10),
        ]);
        let started = orchestrator.start_rebuild_resource("gas");
        let job = orchestrator.join(started.job_id.unwrap()).await.unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress.total, 2);
        assert_eq!(job.progress.processed, 2);
        assert_eq!(job.progress.candles_published, 2);
        assert_eq!(repository.list(CandleType::Index, 60, 1).await.unwrap().len(), 2);
        assert!(repository.list(CandleType::Index, 60, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_job_fails_and_publishes_nothing() {
        let (orchestrator, repository) = orchestrator(vec![price("gas", 10), price("gas", 70)]);
        let started = orchestrator.start_rebuild_all();
        let cancel = orchestrator.cancel(&RebuildScope::All);
        assert!(cancel.success);

        let job = orchestrator.join(started.job_id.unwrap()).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.message.as_deref(), Some(CANCELLED));
        assert!(repository.is_empty().await);

        assert!(!orchestrator.cancel(&RebuildScope::All).success);
    }

    #[tokio::test]
    async fn new_run_supersedes_previous_record_once_running() {
        let (orchestrator, _) = orchestrator(vec![price("gas", 10)]);
        let first = orchestrator.start_rebuild_all().job_id.unwrap();
        orchestrator.join(first).await;

        let second = orchestrator.start_rebuild_all().job_id.unwrap();
        let status = orchestrator.status(&RebuildScope::All);
        assert_eq!(status.current.as_ref().map(|job| job.id), Some(first));
        assert_eq!(status.pending.as_ref().map(|job| job.id), Some(second));

        orchestrator.join(second).await;
        let status = orchestrator.status(&RebuildScope::All);
        assert_eq!(status.current.map(|job| job.id), Some(second));
        assert!(status.pending.is_none());
    }

    #[tokio::test]
    async fn replay_errors_fail_the_job_without_publishing() {
        let (orchestrator, repository) = orchestrator(vec![
            price("gas", 10),
            priced("gas", 20, "garbage", "1"),
            price("gas", 70),
        ]);
        let started = orchestrator.start_rebuild_all();
        let job = orchestrator.join(started.job_id.unwrap()).await.unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.progress.processed, 3);
        assert_eq!(job.progress.errors, 1);
        assert_eq!(job.progress.candles_published, 0);
        let reason = job.message.unwrap();
        assert!(reason.contains("rejected 1 of 3"), "{}", reason);
        assert!(reason.contains("parse error at 20"), "{}", reason);
        assert!(repository.is_empty().await);
    }

    #[tokio::test]
    async fn publish_keeps_observations_ingested_during_replay() {
        let markets = markets();
        let repository = Arc::new(InMemoryCandleRepository::new());
        let live = Arc::new(AsyncMutex::new(CandleAggregator::new(
            Arc::clone(&markets),
            repository.clone(),
            vec![3600],
        )));
        let history = Arc::new(GatedHistory {
            inner: InMemoryObservationHistory::new(),
            loaded: Notify::new(),
            release: Notify::new(),
        });
        let orchestrator = RebuildOrchestrator::new(
            Arc::clone(&markets),
            history.clone(),
            Arc::clone(&live),
            vec![3600],
            2,
        );

        let first = priced("gas", 1000, "100", "0");
        live.lock().await.process(&first).await.unwrap();
        history.append(&first).await.unwrap();

        let started = orchestrator.start_rebuild_resource("gas");
        history.loaded.notified().await;

        // lands after the snapshot, before publish
        let second = priced("gas", 1800, "100", "200");
        live.lock().await.process(&second).await.unwrap();
        history.append(&second).await.unwrap();
        history.release.notify_one();

        let job = orchestrator.join(started.job_id.unwrap()).await.unwrap();
        assert_eq!(job.state, JobState::Completed, "{:?}", job.message);
        assert_eq!(job.progress.processed, 1);
        assert_eq!(job.progress.candles_published, 0);
        assert!(repository.is_empty().await);

        let open = live.lock().await.open_candle(CandleType::Index, 1, 3600).cloned().unwrap();
        assert_eq!((open.sum_used.as_str(), open.sum_fee_paid.as_str()), ("200", "200"));
        assert_eq!(open.close, "1");

        live.lock().await.process(&priced("gas", 3700, "1", "1")).await.unwrap();
        let closed = repository.list(CandleType::Index, 3600, 1).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!((closed[0].sum_used.as_str(), closed[0].close.as_str()), ("200", "1"));
    }
}
