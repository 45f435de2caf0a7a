//! Concurrent candidate enrichment.
//!
//! Each worker owns one candidate end-to-end:
//! 1. category exclusion and blacklist (no I/O)
//! 2. history window load
//! 3. live quote through the rate-limited fetcher, else the newest usable snapshot
//! 4. price sanity, spread, liquidity and margin checks
//! 5. trailing averages and the bottom-rebound signal
//!
//! Rejections are counted and dropped; the next pass reconsiders them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::{RateLimitedFetcher, WorkerLimiter};
use super::pool::{run_pool, Worker};
use crate::config::{EnrichmentConfig, FilterConfig};
use crate::sources::{Account, AccountPool};
use crate::storage::Persistence;
use crate::strategy::signals::detect_bottom_rebound;
use crate::types::{Candidate, EnrichedCandidate, Item, ItemId, PriceQuote, Snapshot, SpreadEconomics};

/// Buy-order count assumed per listing when a snapshot lacks one.
const ESTIMATED_BUY_RATIO: f64 = 0.35;

// ---------------------------------------------------------------------------
// Blacklist
// ---------------------------------------------------------------------------

/// Item ids never worth evaluating. Loaded from a newline-separated file;
/// `#` starts a comment.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    ids: HashSet<ItemId>,
    source: Option<PathBuf>,
}

impl Blacklist {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = ItemId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            source: None,
        }
    }

    /// Load from `path`. A missing file gives an empty list.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut list = Self {
            ids: HashSet::new(),
            source: Some(path.as_ref().to_path_buf()),
        };
        list.refresh()?;
        Ok(list)
    }

    /// Like [`Blacklist::load`], but an unreadable file gives an empty list
    /// that still tracks `path`, so a later refresh can pick it up.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let mut list = Self {
            ids: HashSet::new(),
            source: Some(path.as_ref().to_path_buf()),
        };
        if let Err(e) = list.refresh() {
            warn!(
                path = %path.as_ref().display(),
                error = %format!("{e:#}"),
                "Blacklist unreadable, starting with an empty list"
            );
        }
        list
    }

    /// Re-read the backing file. Returns the new entry count.
    pub fn refresh(&mut self) -> Result<usize> {
        let Some(path) = self.source.as_ref() else {
            return Ok(self.ids.len());
        };
        if !path.exists() {
            warn!(path = %path.display(), "Blacklist file not found, using empty list");
            self.ids.clear();
            return Ok(0);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read blacklist: {}", path.display()))?;
        self.ids = parse_blacklist(&contents);
        info!(path = %path.display(), entries = self.ids.len(), "Blacklist loaded");
        Ok(self.ids.len())
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn parse_blacklist(contents: &str) -> HashSet<ItemId> {
    contents
        .lines()
        .filter_map(|line| {
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                return None;
            }
            match entry.parse::<ItemId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(line = entry, "Skipping malformed blacklist entry");
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RejectReason {
    ExcludedCategory,
    Blacklisted,
    NoHistory,
    NoUsablePrice,
    PriceOutOfBounds,
    SpreadTooWide,
    NoSpread,
    NoLiquidityData,
    InsufficientLiquidity,
    BelowMinProfit,
    NoRebound,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ExcludedCategory => "excluded_category",
            RejectReason::Blacklisted => "blacklisted",
            RejectReason::NoHistory => "no_history",
            RejectReason::NoUsablePrice => "no_usable_price",
            RejectReason::PriceOutOfBounds => "price_out_of_bounds",
            RejectReason::SpreadTooWide => "spread_too_wide",
            RejectReason::NoSpread => "no_spread",
            RejectReason::NoLiquidityData => "no_liquidity_data",
            RejectReason::InsufficientLiquidity => "insufficient_liquidity",
            RejectReason::BelowMinProfit => "below_min_profit",
            RejectReason::NoRebound => "no_rebound",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum EnrichOutcome {
    Survived(Box<EnrichedCandidate>),
    Rejected { item_id: ItemId, reason: RejectReason },
}

/// Collector summary of one enrichment run.
#[derive(Debug, Default)]
pub struct EnrichmentReport {
    pub survivors: Vec<EnrichedCandidate>,
    pub processed: usize,
    pub rejected: usize,
    pub rejections: BTreeMap<RejectReason, usize>,
    /// Candidates priced from a live quote.
    pub live_quotes: u64,
    /// Candidates whose live quote failed.
    pub fallback_quotes: u64,
    pub cancelled: bool,
}

impl EnrichmentReport {
    fn record(&mut self, outcome: EnrichOutcome) {
        self.processed += 1;
        match outcome {
            EnrichOutcome::Survived(c) => self.survivors.push(*c),
            EnrichOutcome::Rejected { item_id, reason } => {
                debug!(item_id, reason = %reason, "Candidate rejected");
                self.rejected += 1;
                *self.rejections.entry(reason).or_default() += 1;
            }
        }
    }

    fn merge(&mut self, other: EnrichmentReport) {
        self.survivors.extend(other.survivors);
        self.processed += other.processed;
        self.rejected += other.rejected;
        for (reason, n) in other.rejections {
            *self.rejections.entry(reason).or_default() += n;
        }
        self.live_quotes += other.live_quotes;
        self.fallback_quotes += other.fallback_quotes;
        self.cancelled |= other.cancelled;
    }
}

// ---------------------------------------------------------------------------
// Candidate evaluation
// ---------------------------------------------------------------------------

/// Everything a worker reads; shared immutably across one run.
struct EnrichmentShared {
    fetcher: Arc<RateLimitedFetcher>,
    store: Arc<dyn Persistence>,
    blacklist: Arc<Blacklist>,
    filters: FilterConfig,
    config: EnrichmentConfig,
    excluded: Vec<String>,
    live_quotes: AtomicU64,
    fallback_quotes: AtomicU64,
}

/// Apply the price, liquidity and margin rules to a loaded candidate.
///
/// `candidate.snapshots` must be non-empty and newest first.
fn evaluate(
    filters: &FilterConfig,
    config: &EnrichmentConfig,
    candidate: Candidate,
    quote: &PriceQuote,
    now: DateTime<Utc>,
) -> Result<EnrichedCandidate, RejectReason> {
    let fallback = if quote.ok {
        None
    } else {
        Some(
            candidate
                .snapshots
                .iter()
                .find(|s| s.has_usable_prices())
                .ok_or(RejectReason::NoUsablePrice)?,
        )
    };

    let (buy, sell) = match fallback {
        None => (quote.buy_price, quote.sell_price),
        Some(snap) => (snap.buy_price.unwrap_or(0.0), snap.sell_price.unwrap_or(0.0)),
    };

    let in_bounds = |p: f64| p > 0.0 && p >= filters.min_price && p <= filters.max_reasonable_price;
    if !in_bounds(buy) || !in_bounds(sell) {
        return Err(RejectReason::PriceOutOfBounds);
    }
    if sell > buy * filters.max_price_spread {
        return Err(RejectReason::SpreadTooWide);
    }
    let econ = SpreadEconomics::compute(buy, sell, filters.fee_rate);
    if econ.net_sell <= buy {
        return Err(RejectReason::NoSpread);
    }

    let (buy_count, sell_count) = match fallback {
        None => (quote.buy_count, quote.sell_count),
        Some(snap) => match snap.sell_count {
            Some(sc) if sc > 0 => {
                let bc = snap
                    .buy_count
                    .unwrap_or((f64::from(sc) * ESTIMATED_BUY_RATIO) as u32);
                (bc, sc)
            }
            _ => return Err(RejectReason::NoLiquidityData),
        },
    };
    if sell_count < filters.min_sell_count || buy_count < filters.min_buy_count {
        return Err(RejectReason::InsufficientLiquidity);
    }

    let days_of_data = candidate.snapshots.len() as u32;
    let has_enough_history = days_of_data >= filters.min_days_history;
    let (avg_buy_7d, avg_sell_7d) = if has_enough_history {
        (
            positive_mean(candidate.snapshots.iter().filter_map(|s| s.buy_price)).unwrap_or(buy),
            positive_mean(candidate.snapshots.iter().filter_map(|s| s.sell_price)).unwrap_or(sell),
        )
    } else {
        (buy, sell)
    };

    if econ.profit_rate < filters.min_profit_rate {
        return Err(RejectReason::BelowMinProfit);
    }

    let rebound = detect_bottom_rebound(sell, &candidate.snapshots, now, config);
    if config.only_bottom_rebound && rebound.is_none() {
        return Err(RejectReason::NoRebound);
    }

    let live_quote = fallback.is_none();
    let rank = candidate.latest().and_then(|s| s.rank);
    let sell_history = candidate.sell_series();
    Ok(EnrichedCandidate {
        item: candidate.item,
        buy_price: buy,
        sell_price: sell,
        buy_count,
        sell_count,
        avg_buy_7d,
        avg_sell_7d,
        days_of_data,
        has_enough_history,
        rank,
        sell_history,
        live_quote,
        rebound,
    })
}

fn positive_mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .filter(|v| *v > 0.0)
        .fold((0.0, 0u32), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / f64::from(n))
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct EnrichmentWorker {
    shared: Arc<EnrichmentShared>,
    limiter: WorkerLimiter,
    account: Arc<Account>,
}

#[async_trait]
impl Worker for EnrichmentWorker {
    type Task = Item;
    type Output = EnrichOutcome;

    async fn process(&mut self, item: Item) -> EnrichOutcome {
        let shared = Arc::clone(&self.shared);
        let item_id = item.id;
        let reject = |reason| EnrichOutcome::Rejected { item_id, reason };

        let lower = item.name.to_lowercase();
        if shared.excluded.iter().any(|k| lower.contains(k.as_str())) {
            return reject(RejectReason::ExcludedCategory);
        }
        if shared.blacklist.contains(item_id) {
            return reject(RejectReason::Blacklisted);
        }

        let now = Utc::now();
        let since = now - ChronoDuration::days(shared.config.history_days);
        let snapshots: Vec<Snapshot> = match shared.store.load_snapshots(item_id, since).await {
            Ok(s) => s,
            Err(e) => {
                warn!(item_id, error = %e, "History load failed");
                Vec::new()
            }
        };
        if snapshots.is_empty() {
            return reject(RejectReason::NoHistory);
        }

        let quote = shared.fetcher.fetch(&mut self.limiter, &self.account, item_id).await;
        if quote.ok {
            shared.live_quotes.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.fallback_quotes.fetch_add(1, Ordering::Relaxed);
        }

        let candidate = Candidate::new(item, snapshots);
        match evaluate(&shared.filters, &shared.config, candidate, &quote, now) {
            Ok(enriched) => EnrichOutcome::Survived(Box::new(enriched)),
            Err(reason) => reject(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct ConcurrentEnrichmentPool {
    fetcher: Arc<RateLimitedFetcher>,
    store: Arc<dyn Persistence>,
    accounts: AccountPool,
    blacklist: Arc<Blacklist>,
    filters: FilterConfig,
    config: EnrichmentConfig,
    fetch_interval: Duration,
}

impl ConcurrentEnrichmentPool {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        store: Arc<dyn Persistence>,
        accounts: AccountPool,
        blacklist: Blacklist,
        filters: FilterConfig,
        config: EnrichmentConfig,
        fetch_interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            accounts,
            blacklist: Arc::new(blacklist),
            filters,
            config,
            fetch_interval,
        }
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Reload the blacklist; runs already started keep their snapshot.
    pub fn refresh_blacklist(&mut self) -> Result<usize> {
        let mut next = (*self.blacklist).clone();
        let n = next.refresh()?;
        self.blacklist = Arc::new(next);
        Ok(n)
    }

    /// Enrich with the configured layout: sharded across accounts when
    /// enabled and more than one account is available.
    pub async fn enrich(&self, items: Vec<Item>, cancel: &CancellationToken) -> EnrichmentReport {
        if self.config.shard_by_account && self.accounts.len() > 1 {
            self.enrich_sharded(items, cancel).await
        } else {
            self.enrich_all(items, self.config.concurrency, cancel).await
        }
    }

    /// One pool of `concurrency` workers; worker `i` uses account `i` round-robin.
    pub async fn enrich_all(
        &self,
        items: Vec<Item>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> EnrichmentReport {
        self.run(items, concurrency, &self.accounts, cancel).await
    }

    /// Partition `items` contiguously across accounts, run one pool per
    /// account concurrently and merge the reports.
    pub async fn enrich_sharded(&self, items: Vec<Item>, cancel: &CancellationToken) -> EnrichmentReport {
        let shards = self.accounts.len().max(1);
        if items.is_empty() {
            return EnrichmentReport::default();
        }
        let chunk = items.len().div_ceil(shards);
        let per_shard = self.config.concurrency.div_ceil(shards).max(1);

        let pools: Vec<AccountPool> = self
            .accounts
            .all()
            .iter()
            .map(|a| AccountPool::single(Arc::clone(a)))
            .collect();
        let runs = items
            .chunks(chunk)
            .zip(pools.iter())
            .map(|(part, pool)| self.run(part.to_vec(), per_shard, pool, cancel));

        let mut merged = EnrichmentReport::default();
        for report in join_all(runs).await {
            merged.merge(report);
        }
        info!(
            shards,
            survived = merged.survivors.len(),
            rejected = merged.rejected,
            "Sharded enrichment complete"
        );
        merged
    }

    async fn run(
        &self,
        items: Vec<Item>,
        concurrency: usize,
        accounts: &AccountPool,
        cancel: &CancellationToken,
    ) -> EnrichmentReport {
        let total = items.len();
        let shared = Arc::new(EnrichmentShared {
            fetcher: Arc::clone(&self.fetcher),
            store: Arc::clone(&self.store),
            blacklist: Arc::clone(&self.blacklist),
            filters: self.filters.clone(),
            config: self.config.clone(),
            excluded: self
                .filters
                .excluded_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            live_quotes: AtomicU64::new(0),
            fallback_quotes: AtomicU64::new(0),
        });

        let workers: Vec<EnrichmentWorker> = (0..concurrency.max(1))
            .map(|i| EnrichmentWorker {
                shared: Arc::clone(&shared),
                limiter: WorkerLimiter::new(self.fetch_interval),
                account: accounts.for_worker(i),
            })
            .collect();

        info!(count = total, workers = workers.len(), "Starting enrichment");
        let run = run_pool("enrichment", workers, items, cancel).await;

        let mut report = EnrichmentReport {
            cancelled: run.cancelled,
            ..Default::default()
        };
        for outcome in run.results {
            report.record(outcome);
        }
        report.live_quotes = shared.live_quotes.load(Ordering::Relaxed);
        report.fallback_quotes = shared.fallback_quotes.load(Ordering::Relaxed);

        info!(
            processed = report.processed,
            survived = report.survivors.len(),
            rejected = report.rejected,
            live = report.live_quotes,
            fallback = report.fallback_quotes,
            cancelled = report.cancelled,
            "Enrichment complete"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
