//! Rate-limited live price fetching.
//!
//! The limiter is per worker, not global: each pool member owns a
//! `WorkerLimiter`, so N workers get N times the throughput of one while
//! each stays within the per-identity request contract.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use crate::sources::{Account, BuySide, PriceSource};
use crate::types::{ItemId, PriceQuote, SourceError};

// ---------------------------------------------------------------------------
// Per-worker limiter
// ---------------------------------------------------------------------------

/// Fixed-interval ticker owned by a single worker.
pub struct WorkerLimiter {
    interval: Interval,
}

impl WorkerLimiter {
    /// The first `acquire` returns immediately; later ones wait out the period.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn acquire(&mut self) {
        self.interval.tick().await;
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Request counters shared by every worker using this fetcher.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
}

pub struct RateLimitedFetcher {
    source: Arc<dyn PriceSource>,
    timeout: Duration,
    stats: FetchStats,
}

impl RateLimitedFetcher {
    pub fn new(source: Arc<dyn PriceSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            stats: FetchStats::default(),
        }
    }

    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    /// Fetch both sides for `item_id`. Never fails: a sub-request error
    /// yields `ok = false` with the reasons joined, and the caller decides
    /// whether to fall back to stored data.
    pub async fn fetch(&self, limiter: &mut WorkerLimiter, account: &Account, item_id: ItemId) -> PriceQuote {
        limiter.acquire().await;
        let buy = self.guarded(self.source.best_buy(account, item_id)).await;
        limiter.acquire().await;
        let sell = self.guarded(self.source.best_sell(account, item_id)).await;

        match (buy, sell) {
            (Ok(b), Ok(s)) => PriceQuote::resolved(b.price, b.count, s.price, s.count),
            (buy, sell) => {
                let reason = [
                    buy.err().map(|e| format!("buy: {e}")),
                    sell.err().map(|e| format!("sell: {e}")),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("; ");
                debug!(item_id, source = self.source.name(), reason = %reason, "Live quote failed");
                PriceQuote::failed(reason)
            }
        }
    }

    /// Best standing purchase order only, for bid re-pricing.
    pub async fn best_buy(
        &self,
        limiter: &mut WorkerLimiter,
        account: &Account,
        item_id: ItemId,
    ) -> Result<BuySide, SourceError> {
        limiter.acquire().await;
        self.guarded(self.source.best_buy(account, item_id)).await
    }

    async fn guarded<T>(&self, call: impl Future<Output = Result<T, SourceError>>) -> Result<T, SourceError> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(r) => r,
            Err(_) => Err(SourceError::Timeout),
        };
        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::ScriptedPrices;
    use tokio::time::Instant;

    fn make_fetcher(prices: ScriptedPrices) -> Arc<RateLimitedFetcher> {
        Arc::new(RateLimitedFetcher::new(Arc::new(prices), Duration::from_secs(5)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_quote() {
        let prices = ScriptedPrices::new();
        prices.set(1, 10.0, 8, 12.0, 150);
        let fetcher = make_fetcher(prices);
        let mut limiter = WorkerLimiter::new(Duration::from_secs(1));
        let q = fetcher.fetch(&mut limiter, &Account::anonymous(), 1).await;
        assert!(q.ok);
        assert_eq!(q.buy_price, 10.0);
        assert_eq!(q.sell_count, 150);
        assert_eq!(fetcher.stats().requests.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reason_names_side() {
        let prices = ScriptedPrices::new();
        prices.fail(1, SourceError::RateLimited);
        let fetcher = make_fetcher(prices);
        let mut limiter = WorkerLimiter::new(Duration::from_secs(1));
        let q = fetcher.fetch(&mut limiter, &Account::anonymous(), 1).await;
        assert!(!q.ok);
        let reason = q.failure_reason.unwrap();
        assert!(reason.contains("buy: rate limited"));
        assert!(reason.contains("sell: rate limited"));
        assert_eq!(fetcher.stats().failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_price_not_ok() {
        let prices = ScriptedPrices::new();
        prices.set(1, 0.0, 0, 12.0, 150);
        let fetcher = make_fetcher(prices);
        let mut limiter = WorkerLimiter::new(Duration::from_millis(10));
        assert!(!fetcher.fetch(&mut limiter, &Account::anonymous(), 1).await.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        let prices = ScriptedPrices::new();
        prices.set(1, 10.0, 8, 12.0, 150);
        prices.set_delay(Duration::from_secs(30));
        let fetcher = make_fetcher(prices);
        let mut limiter = WorkerLimiter::new(Duration::from_millis(10));
        let q = fetcher.fetch(&mut limiter, &Account::anonymous(), 1).await;
        assert!(!q.ok);
        assert!(q.failure_reason.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_worker_limiters_scale_throughput() {
        let prices = ScriptedPrices::new();
        for id in 0..6 {
            prices.set(id, 10.0, 8, 12.0, 150);
        }
        let fetcher = make_fetcher(prices);
        let start = Instant::now();

        // Two workers with their own limiter, three items each.
        let mut handles = Vec::new();
        for w in 0..2i64 {
            let fetcher = Arc::clone(&fetcher);
            handles.push(tokio::spawn(async move {
                let mut limiter = WorkerLimiter::new(Duration::from_secs(1));
                let account = Account::anonymous();
                for id in (w * 3)..(w * 3 + 3) {
                    assert!(fetcher.fetch(&mut limiter, &account, id).await.ok);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Six ticks per worker: the first is free, five one-second waits.
        // A shared limiter would need eleven.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(7), "elapsed {elapsed:?}");
    }
}
