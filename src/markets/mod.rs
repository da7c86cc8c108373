//! Market metadata cache
//!
//! Process-wide lookup from market index to market/resource metadata and the
//! market's active time window. Entries are append-only: a refresh never
//! updates a market that is already cached, so changed windows require a
//! restart of the cache.

mod directory;

pub use directory::{spawn_refresh_task, FileMarketDirectory, MarketDirectory};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

use crate::types::{MarketInfo, NO_RESOURCE_SLUG};

/// One market group as delivered by the market directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketGroupRecord {
    pub index: u64,
    #[serde(default)]
    pub address: String,
    pub chain_id: u64,
    #[serde(default)]
    pub resource_slug: Option<String>,
    #[serde(default)]
    pub is_cumulative: bool,
    #[serde(default)]
    pub markets: Vec<MarketRecord>,
}

/// One market inside a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRecord {
    pub index: u64,
    pub market_id: u64,
    pub start_timestamp: i64,
    #[serde(default)]
    pub end_timestamp: i64,
}

/// Outcome of a directory refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub inserted: usize,
    pub skipped_existing: usize,
    pub skipped_no_address: usize,
}

/// Append-only market metadata cache
#[derive(Debug, Default)]
pub struct MarketMetadataCache {
    markets: RwLock<BTreeMap<u64, MarketInfo>>,
}

impl MarketMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every market not yet cached; existing entries are left untouched
    pub fn refresh(&self, groups: &[MarketGroupRecord]) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut markets = self.markets.write().unwrap_or_else(PoisonError::into_inner);

        for group in groups {
            let resource_slug = group
                .resource_slug
                .as_deref()
                .filter(|slug| !slug.is_empty())
                .unwrap_or(NO_RESOURCE_SLUG);

            for market in &group.markets {
                if markets.contains_key(&market.index) {
                    debug!(market_index = market.index, "Market already cached, skipping");
                    summary.skipped_existing += 1;
                    continue;
                }
                if group.address.is_empty() {
                    debug!(
                        market_index = market.index,
                        group_index = group.index,
                        "Market group has no address, skipping"
                    );
                    summary.skipped_no_address += 1;
                    continue;
                }

                markets.insert(
                    market.index,
                    MarketInfo {
                        resource_slug: resource_slug.to_string(),
                        market_group_index: group.index,
                        market_index: market.index,
                        market_id: market.market_id,
                        market_group_address: group.address.clone(),
                        market_group_chain_id: group.chain_id,
                        start_timestamp: market.start_timestamp,
                        end_timestamp: market.end_timestamp,
                        is_cumulative: group.is_cumulative,
                    },
                );
                summary.inserted += 1;
            }
        }

        if summary.inserted > 0 {
            info!(
                inserted = summary.inserted,
                skipped_existing = summary.skipped_existing,
                skipped_no_address = summary.skipped_no_address,
                total = markets.len(),
                "Market metadata cache refreshed"
            );
        }
        summary
    }

    pub fn get(&self, market_index: u64) -> Option<MarketInfo> {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&market_index)
            .cloned()
    }

    /// Linear scan; the number of markets stays in the hundreds
    pub fn get_by_chain_and_address(
        &self,
        chain_id: u64,
        address: &str,
        market_id: u64,
    ) -> Option<MarketInfo> {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|m| {
                m.market_group_chain_id == chain_id
                    && m.market_id == market_id
                    && m.market_group_address.eq_ignore_ascii_case(address)
            })
            .cloned()
    }

    /// Market indexes linked to a resource, ascending
    pub fn all_indexes_for_resource(&self, resource_slug: &str) -> Vec<u64> {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|m| m.resource_slug == resource_slug)
            .map(|m| m.market_index)
            .collect()
    }

    /// Unknown markets are never active
    pub fn is_active(&self, market_index: u64, timestamp: i64) -> bool {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&market_index)
            .map(|m| m.is_active_at(timestamp))
            .unwrap_or(false)
    }

    pub fn active_markets(&self, timestamp: i64) -> Vec<u64> {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|m| m.is_active_at(timestamp))
            .map(|m| m.market_index)
            .collect()
    }

    /// Snapshot of every cached market, ordered by index
    pub fn all(&self) -> Vec<MarketInfo> {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Distinct resource slugs with at least one market
    pub fn resource_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|m| m.resource_slug.clone())
            .collect();
        slugs.sort();
        slugs.dedup();
        slugs
    }

    pub fn len(&self) -> usize {
        self.markets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
