//! Candle Aggregator - turns observations into interval candles
//!
//! Each observation is resolved to its markets and applied to every
//! configured interval through a small state machine:
//!
//! | open candle            | market active | action                         |
//! |------------------------|---------------|--------------------------------|
//! | none                   | yes           | create at bucket start         |
//! | none                   | no            | nothing                        |
//! | older bucket           | yes           | flush, create carrying sums    |
//! | older bucket           | no            | flush, series stops            |
//! | same bucket            | yes           | update in place                |
//! | same bucket            | no            | nothing (candle left stale)    |
//! | newer bucket (late)    | any           | rejected                       |
//!
//! An observation is applied in three phases: every slot change is computed
//! first, then closed candles are flushed to the repository, and only then is
//! the runtime store updated. A parse or persistence failure therefore leaves
//! every open candle exactly as it was, and the observation can be retried.

use ethers::types::U256;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::interval::Bucket;
use super::pricing::{parse_amount, parse_price, CumulativeSums};
use super::store::RuntimeCandleStore;
use crate::error::CandleError;
use crate::markets::MarketMetadataCache;
use crate::persistence::CandleRepository;
use crate::types::{Candle, CandleType, MarketInfo, Observation, PriceObservation, TradeObservation};

/// Decision for one (market, interval) slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    Create,
    Update,
    Rollover,
    SkipInactive,
    RejectLate,
}

impl SlotAction {
    pub fn decide(existing: Option<&Candle>, bucket_start: i64, active: bool) -> Self {
        match existing {
            None if active => Self::Create,
            None => Self::SkipInactive,
            Some(open) if open.timestamp < bucket_start => Self::Rollover,
            Some(open) if open.timestamp == bucket_start && active => Self::Update,
            Some(open) if open.timestamp == bucket_start => Self::SkipInactive,
            Some(_) => Self::RejectLate,
        }
    }
}

/// Per-observation tally of slot changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub created: usize,
    pub updated: usize,
    pub flushed: usize,
    pub stopped: usize,
    pub skipped_inactive: usize,
    pub late_rejected: usize,
}

impl AggregationReport {
    pub fn merge(&mut self, other: &AggregationReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.flushed += other.flushed;
        self.stopped += other.stopped;
        self.skipped_inactive += other.skipped_inactive;
        self.late_rejected += other.late_rejected;
    }
}

/// Parsed value carried by an observation
#[derive(Debug, Clone, Copy)]
enum Tick {
    Index { fee_paid: U256, used: U256 },
    Trade { price: Decimal },
}

impl Tick {
    fn candle_type(&self) -> CandleType {
        match self {
            Tick::Index { .. } => CandleType::Index,
            Tick::Trade { .. } => CandleType::MarketPrice,
        }
    }

    /// New open candle; index candles carry sums from `previous`
    fn open_candle(
        &self,
        market: &MarketInfo,
        interval: i64,
        bucket: Bucket,
        timestamp: i64,
        previous: Option<&Candle>,
    ) -> Result<Candle, CandleError> {
        let (price, sum_fee_paid, sum_used) = match self {
            Tick::Index { fee_paid, used } => {
                let sums = CumulativeSums::from_candle(previous)?.add(*fee_paid, *used)?;
                (
                    sums.average().to_string(),
                    sums.fee_paid.to_string(),
                    sums.used.to_string(),
                )
            }
            Tick::Trade { price } => (price.to_string(), "0".to_string(), "0".to_string()),
        };

        Ok(Candle {
            id: None,
            candle_type: self.candle_type(),
            interval,
            market_index: market.market_index,
            resource_slug: market.resource_slug.clone(),
            timestamp: bucket.start,
            end_timestamp: bucket.end,
            last_updated_timestamp: timestamp,
            open: price.clone(),
            high: price.clone(),
            low: price.clone(),
            close: price,
            sum_fee_paid,
            sum_used,
            market_id: market.market_id,
            address: market.market_group_address.clone(),
            chain_id: market.market_group_chain_id,
        })
    }

    /// Apply to the open candle of the same bucket
    fn update(&self, current: &Candle, timestamp: i64) -> Result<Candle, CandleError> {
        let mut next = current.clone();
        match self {
            Tick::Index { fee_paid, used } => {
                let sums = CumulativeSums::from_candle(Some(current))?.add(*fee_paid, *used)?;
                let average = sums.average().to_string();
                next.high = average.clone();
                next.low = average.clone();
                next.close = average;
                next.sum_fee_paid = sums.fee_paid.to_string();
                next.sum_used = sums.used.to_string();
            }
            Tick::Trade { price } => {
                let high = parse_price(&current.high)?;
                let low = parse_price(&current.low)?;
                next.high = high.max(*price).to_string();
                next.low = low.min(*price).to_string();
                next.close = price.to_string();
            }
        }
        next.last_updated_timestamp = timestamp;
        Ok(next)
    }
}

struct PlannedChange {
    action: SlotAction,
    market_index: u64,
    interval: i64,
    flush: Option<Candle>,
    next: Option<Candle>,
}

/// Streaming candle aggregator for one ingestion path
pub struct CandleAggregator {
    markets: Arc<MarketMetadataCache>,
    store: RuntimeCandleStore,
    repository: Arc<dyn CandleRepository>,
    intervals: Vec<i64>,
}

impl CandleAggregator {
    pub fn new(
        markets: Arc<MarketMetadataCache>,
        repository: Arc<dyn CandleRepository>,
        intervals: Vec<i64>,
    ) -> Self {
        let mut intervals = intervals;
        intervals.retain(|i| *i > 0);
        intervals.sort_unstable();
        intervals.dedup();
        Self {
            markets,
            store: RuntimeCandleStore::new(),
            repository,
            intervals,
        }
    }

    pub fn intervals(&self) -> &[i64] {
        &self.intervals
    }

    pub fn markets(&self) -> &Arc<MarketMetadataCache> {
        &self.markets
    }

    pub fn store(&self) -> &RuntimeCandleStore {
        &self.store
    }

    pub fn open_candle(&self, candle_type: CandleType, market_index: u64, interval: i64) -> Option<&Candle> {
        self.store.get(candle_type, market_index, interval)
    }

    pub async fn process(&mut self, observation: &Observation) -> Result<AggregationReport, CandleError> {
        match observation {
            Observation::Price(obs) => self.process_price(obs).await,
            Observation::Trade(obs) => self.process_trade(obs).await,
        }
    }

    /// Apply a resource price tick to every market of the resource
    pub async fn process_price(&mut self, obs: &PriceObservation) -> Result<AggregationReport, CandleError> {
        let markets: Vec<MarketInfo> = self
            .markets
            .all_indexes_for_resource(&obs.resource_slug)
            .into_iter()
            .filter_map(|index| self.markets.get(index))
            .collect();
        if markets.is_empty() {
            return Err(CandleError::ResourceNotIndexed(obs.resource_slug.clone()));
        }

        let tick = Tick::Index {
            fee_paid: parse_amount("feePaid", &obs.fee_paid)?,
            used: parse_amount("used", &obs.used)?,
        };
        self.apply(&markets, obs.timestamp, tick).await
    }

    /// Apply a trade fill to its market
    pub async fn process_trade(&mut self, obs: &TradeObservation) -> Result<AggregationReport, CandleError> {
        let market = self
            .markets
            .get_by_chain_and_address(obs.chain_id, &obs.market_group_address, obs.market_id)
            .ok_or_else(|| CandleError::MarketNotFound {
                chain_id: obs.chain_id,
                address: obs.market_group_address.clone(),
                market_id: obs.market_id,
            })?;

        let tick = Tick::Trade {
            price: parse_price(&obs.price)?,
        };
        self.apply(std::slice::from_ref(&market), obs.timestamp, tick).await
    }

    async fn apply(
        &mut self,
        markets: &[MarketInfo],
        timestamp: i64,
        tick: Tick,
    ) -> Result<AggregationReport, CandleError> {
        let candle_type = tick.candle_type();
        let mut report = AggregationReport::default();
        let mut plan: Vec<PlannedChange> = Vec::new();

        for market in markets {
            let active = self.markets.is_active(market.market_index, timestamp);
            for &interval in &self.intervals {
                let bucket = Bucket::containing(timestamp, interval)
                    .ok_or(CandleError::InvalidTimestamp { timestamp, interval })?;
                let existing = self.store.get(candle_type, market.market_index, interval);
                let action = SlotAction::decide(existing, bucket.start, active);

                let (flush, next) = match (action, existing) {
                    (SlotAction::Create, _) => (
                        None,
                        Some(tick.open_candle(market, interval, bucket, timestamp, None)?),
                    ),
                    (SlotAction::Update, Some(open)) => (None, Some(tick.update(open, timestamp)?)),
                    (SlotAction::Rollover, Some(open)) => {
                        let next = if active {
                            Some(tick.open_candle(market, interval, bucket, timestamp, Some(open))?)
                        } else {
                            None
                        };
                        (Some(open.clone()), next)
                    }
                    (SlotAction::RejectLate, Some(open)) => {
                        warn!(
                            candle_type = %candle_type,
                            market_index = market.market_index,
                            interval,
                            timestamp,
                            open_bucket = open.timestamp,
                            "Rejected late observation"
                        );
                        report.late_rejected += 1;
                        continue;
                    }
                    _ => {
                        report.skipped_inactive += 1;
                        continue;
                    }
                };

                plan.push(PlannedChange {
                    action,
                    market_index: market.market_index,
                    interval,
                    flush,
                    next,
                });
            }
        }

        for change in &plan {
            if let Some(closed) = &change.flush {
                self.write_through(closed).await?;
            }
        }

        for change in plan {
            match (change.action, change.next) {
                (SlotAction::Rollover, Some(next)) => {
                    debug!(
                        candle_type = %candle_type,
                        market_index = change.market_index,
                        interval = change.interval,
                        bucket = next.timestamp,
                        "Candle rolled over"
                    );
                    report.flushed += 1;
                    report.created += 1;
                    self.store.set(candle_type, change.market_index, change.interval, next);
                }
                (SlotAction::Rollover, None) => {
                    debug!(
                        candle_type = %candle_type,
                        market_index = change.market_index,
                        interval = change.interval,
                        "Market inactive on rollover, series stopped"
                    );
                    report.flushed += 1;
                    report.stopped += 1;
                    self.store.clear(candle_type, change.market_index, change.interval);
                }
                (SlotAction::Create, Some(next)) => {
                    report.created += 1;
                    self.store.set(candle_type, change.market_index, change.interval, next);
                }
                (SlotAction::Update, Some(next)) => {
                    report.updated += 1;
                    self.store.set(candle_type, change.market_index, change.interval, next);
                }
                _ => {}
            }
        }

        Ok(report)
    }

    /// Write a candle through to its durable row
    pub async fn write_through(&self, candle: &Candle) -> Result<Candle, CandleError> {
        let mut row = self
            .repository
            .get_or_create(
                candle.candle_type,
                candle.interval,
                candle.market_index,
                &candle.resource_slug,
                candle.timestamp,
            )
            .await?;
        row.assign_values(candle);
        Ok(self.repository.save(row).await?)
    }

    /// Persist every open candle without closing it
    pub async fn flush_all(&self) -> Result<usize, CandleError> {
        let open = self.store.snapshot();
        for candle in &open {
            self.write_through(candle).await?;
        }
        Ok(open.len())
    }

    /// Load the latest persisted candle of every known series into empty slots
    pub async fn warm_start(&mut self) -> Result<usize, CandleError> {
        let intervals = self.intervals.clone();
        let mut loaded = 0;
        for market in self.markets.all() {
            for candle_type in CandleType::ALL {
                for &interval in &intervals {
                    if self.store.get(candle_type, market.market_index, interval).is_some() {
                        continue;
                    }
                    if let Some(latest) = self
                        .repository
                        .latest(candle_type, interval, market.market_index)
                        .await?
                    {
                        self.store.set(candle_type, market.market_index, interval, latest);
                        loaded += 1;
                    }
                }
            }
        }
        Ok(loaded)
    }

    /// Whether an open candle produced elsewhere may replace this slot: only
    /// an empty slot or one still on an earlier bucket qualifies.
    pub fn can_adopt(&self, candle: &Candle) -> bool {
        self.store
            .get(candle.candle_type, candle.market_index, candle.interval)
            .map_or(true, |open| open.timestamp < candle.timestamp)
    }

    /// Install a candle produced elsewhere. Returns whether the slot was replaced.
    pub fn adopt_open_candle(&mut self, candle: Candle) -> bool {
        if !self.can_adopt(&candle) {
            return false;
        }
        self.store.set(candle.candle_type, candle.market_index, candle.interval, candle);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markets::{MarketGroupRecord, MarketRecord};
    use crate::persistence::{InMemoryCandleRepository, MockCandleRepository};

    const SLUG: &str = "ethereum-gas";

    fn cache_with_market(start: i64, end: i64) -> Arc<MarketMetadataCache> {
        let cache = MarketMetadataCache::new();
        cache.refresh(&[MarketGroupRecord {
            index: 1,
            address: "0xAbC".to_string(),
            chain_id: 8453,
            resource_slug: Some(SLUG.to_string()),
            is_cumulative: false,
            markets: vec![MarketRecord {
                index: 1,
                market_id: 1,
                start_timestamp: start,
                end_timestamp: end,
            }],
        }]);
        Arc::new(cache)
    }

    fn price(timestamp: i64, used: &str, fee_paid: &str) -> PriceObservation {
        PriceObservation {
            resource_slug: SLUG.to_string(),
            timestamp,
            used: used.to_string(),
            fee_paid: fee_paid.to_string(),
        }
    }

    fn trade(timestamp: i64, price: &str) -> TradeObservation {
        TradeObservation {
            chain_id: 8453,
            market_group_address: "0xabc".to_string(),
            market_id: 1,
            timestamp,
            price: price.to_string(),
        }
    }

    fn open(agg: &CandleAggregator) -> Option<Candle> {
        agg.open_candle(CandleType::Index, 1, 3600).cloned()
    }

    #[test]
    fn decide_covers_every_branch() {
        let open = Candle::blank(CandleType::Index, 60, 1, SLUG, 120);
        assert_eq!(SlotAction::decide(None, 0, true), SlotAction::Create);
        assert_eq!(SlotAction::decide(None, 0, false), SlotAction::SkipInactive);
        assert_eq!(SlotAction::decide(Some(&open), 180, true), SlotAction::Rollover);
        assert_eq!(SlotAction::decide(Some(&open), 180, false), SlotAction::Rollover);
        assert_eq!(SlotAction::decide(Some(&open), 120, true), SlotAction::Update);
        assert_eq!(SlotAction::decide(Some(&open), 120, false), SlotAction::SkipInactive);
        assert_eq!(SlotAction::decide(Some(&open), 60, true), SlotAction::RejectLate);
    }

    #[tokio::test]
    async fn create_update_rollover_sequence() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo.clone(), vec![3600]);

        // first tick creates without touching storage
        let report = agg.process_price(&price(1000, "100", "10")).await.unwrap();
        assert_eq!(report.created, 1);
        let a = open(&agg).unwrap();
        assert_eq!((a.timestamp, a.end_timestamp), (0, 3600));
        assert_eq!((a.sum_used.as_str(), a.sum_fee_paid.as_str()), ("100", "10"));
        assert_eq!([&a.open, &a.high, &a.low, &a.close], ["0", "0", "0", "0"]);
        assert!(repo.is_empty().await);

        // same bucket updates in place
        let report = agg.process_price(&price(1800, "100", "200")).await.unwrap();
        assert_eq!(report.updated, 1);
        let b = open(&agg).unwrap();
        assert_eq!((b.sum_used.as_str(), b.sum_fee_paid.as_str()), ("200", "210"));
        assert_eq!([&b.high, &b.low, &b.close], ["1", "1", "1"]);
        assert_eq!(b.open, "0");
        assert_eq!(b.last_updated_timestamp, 1800);
        assert!(repo.is_empty().await);

        // next bucket flushes and carries the sums forward
        let report = agg.process_price(&price(3700, "50", "40")).await.unwrap();
        assert_eq!((report.flushed, report.created), (1, 1));
        let persisted = repo.list(CandleType::Index, 3600, 1).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].close, "1");
        assert_eq!(persisted[0].sum_used, "200");
        assert!(persisted[0].id.is_some());

        let c = open(&agg).unwrap();
        assert_eq!(c.timestamp, 3600);
        assert_eq!((c.sum_used.as_str(), c.sum_fee_paid.as_str()), ("250", "250"));
        assert_eq!(c.open, "1");
    }

    #[tokio::test]
    async fn expired_market_gets_no_candle() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 500), repo.clone(), vec![3600]);

        let report = agg.process_price(&price(1000, "100", "10")).await.unwrap();
        assert_eq!(report.skipped_inactive, 1);
        assert!(open(&agg).is_none());
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn inactive_rollover_flushes_and_stops_series() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 3650), repo.clone(), vec![3600]);

        agg.process_price(&price(1000, "100", "10")).await.unwrap();

        let report = agg.process_price(&price(7300, "100", "10")).await.unwrap();
        assert_eq!((report.flushed, report.stopped), (1, 1));
        assert!(agg.open_candle(CandleType::Index, 1, 3600).is_none());
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn late_observation_is_rejected_without_changes() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo.clone(), vec![3600]);

        agg.process_price(&price(3700, "100", "10")).await.unwrap();
        let before = open(&agg).unwrap();

        let report = agg.process_price(&price(100, "100", "9999")).await.unwrap();
        assert_eq!(report.late_rejected, 1);
        assert_eq!(open(&agg).unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_resource_and_market_are_typed_failures() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo, vec![3600]);

        let mut obs = price(10, "1", "1");
        obs.resource_slug = "unknown".to_string();
        assert!(matches!(
            agg.process_price(&obs).await,
            Err(CandleError::ResourceNotIndexed(_))
        ));

        let mut fill = trade(10, "0.5");
        fill.market_id = 99;
        assert!(matches!(
            agg.process_trade(&fill).await,
            Err(CandleError::MarketNotFound { market_id: 99, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_amount_leaves_state_untouched() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo, vec![60, 3600]);

        agg.process_price(&price(1000, "100", "10")).await.unwrap();
        let before = agg.store().snapshot();

        let err = agg.process_price(&price(1010, "1e5", "10")).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert_eq!(agg.store().snapshot(), before);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_open_candle_for_retry() {
        let mut repo = MockCandleRepository::new();
        repo.expect_get_or_create()
            .times(1)
            .returning(|_, _, _, _, _| Err(anyhow::anyhow!("connection reset")));
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), Arc::new(repo), vec![3600]);

        agg.process_price(&price(1000, "100", "10")).await.unwrap();
        let before = open(&agg).unwrap();

        let err = agg.process_price(&price(3700, "100", "10")).await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert_eq!(open(&agg).unwrap(), before);
    }

    #[tokio::test]
    async fn flush_uses_get_or_create_then_save() {
        let mut repo = MockCandleRepository::new();
        repo.expect_get_or_create()
            .withf(|ty, interval, market, slug, ts| {
                *ty == CandleType::Index && *interval == 3600 && *market == 1 && slug.to_string() == SLUG && *ts == 0
            })
            .times(1)
            .returning(|ty, interval, market, slug, ts| {
                let mut row = Candle::blank(ty, interval, market, slug, ts);
                row.id = Some(41);
                Ok(row)
            });
        repo.expect_save()
            .withf(|candle| candle.id == Some(41) && candle.close == "0" && candle.sum_used == "100")
            .times(1)
            .returning(Ok);
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), Arc::new(repo), vec![3600]);

        agg.process_price(&price(1000, "100", "10")).await.unwrap();
        assert_eq!(agg.flush_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn trade_candles_track_classic_ohlc() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo.clone(), vec![3600]);

        for (ts, p) in [(100, "0.50"), (200, "0.70"), (300, "0.40"), (400, "0.55")] {
            agg.process_trade(&trade(ts, p)).await.unwrap();
        }
        let candle = agg.open_candle(CandleType::MarketPrice, 1, 3600).unwrap();
        assert_eq!(
            [&candle.open, &candle.high, &candle.low, &candle.close],
            ["0.5", "0.7", "0.4", "0.55"]
        );
        assert_eq!(candle.sum_used, "0");
        assert!(agg.open_candle(CandleType::Index, 1, 3600).is_none());

        agg.process_trade(&trade(3600, "0.6")).await.unwrap();
        let closed = repo.list(CandleType::MarketPrice, 3600, 1).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close, "0.55");
    }

    #[tokio::test]
    async fn warm_start_restores_cumulative_sums() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let markets = cache_with_market(0, 0);

        let mut first = CandleAggregator::new(Arc::clone(&markets), repo.clone(), vec![3600]);
        first.process_price(&price(1000, "100", "10")).await.unwrap();
        first.flush_all().await.unwrap();

        let mut restarted = CandleAggregator::new(markets, repo.clone(), vec![3600]);
        assert_eq!(restarted.warm_start().await.unwrap(), 1);
        restarted.process_price(&price(3700, "100", "190")).await.unwrap();

        let c = restarted.open_candle(CandleType::Index, 1, 3600).unwrap();
        assert_eq!((c.sum_used.as_str(), c.sum_fee_paid.as_str()), ("200", "200"));
        assert_eq!(c.close, "1");
    }

    #[tokio::test]
    async fn adopt_only_replaces_earlier_buckets() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo, vec![3600]);
        agg.process_price(&price(7300, "1", "1")).await.unwrap();
        let live = open(&agg).unwrap();

        let older = Candle::blank(CandleType::Index, 3600, 1, SLUG, 3600);
        assert!(!agg.adopt_open_candle(older));
        let same = Candle::blank(CandleType::Index, 3600, 1, SLUG, 7200);
        assert!(!agg.can_adopt(&same));
        assert!(!agg.adopt_open_candle(same));
        assert_eq!(open(&agg).unwrap(), live);

        let newer = Candle::blank(CandleType::Index, 3600, 1, SLUG, 10_800);
        assert!(agg.adopt_open_candle(newer));
        assert_eq!(open(&agg).unwrap().timestamp, 10_800);

        let other_interval = Candle::blank(CandleType::Index, 60, 1, SLUG, 0);
        assert!(agg.can_adopt(&other_interval));
    }

    #[tokio::test]
    async fn inactive_market_leaves_open_candle_stale() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 1500), repo.clone(), vec![3600]);

        let report = agg.process_price(&price(1000, "100", "10")).await.unwrap();
        assert_eq!(report.created, 1);
        let before = open(&agg).unwrap();

        let report = agg.process_price(&price(1800, "100", "500")).await.unwrap();
        assert_eq!(report.skipped_inactive, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(open(&agg).unwrap(), before);
        assert_eq!(before.last_updated_timestamp, 1000);
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn timestamp_without_bucket_is_a_parse_error() {
        let repo = Arc::new(InMemoryCandleRepository::new());
        let mut agg = CandleAggregator::new(cache_with_market(0, 0), repo.clone(), vec![60, 3600]);
        agg.process_price(&price(1000, "100", "10")).await.unwrap();
        let before = agg.store().snapshot();

        let err = agg.process_price(&price(i64::MAX - 10, "1", "1")).await.unwrap_err();
        assert!(matches!(err, CandleError::InvalidTimestamp { interval: 3600, .. }));
        assert_eq!(err.kind(), "parse");
        assert_eq!(agg.store().snapshot(), before);
        assert!(repo.is_empty().await);

        let err = agg.process_trade(&trade(i64::MAX - 10, "0.5")).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(agg.open_candle(CandleType::MarketPrice, 1, 60).is_none());
    }
}
