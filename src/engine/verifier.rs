//! Last-look verification before committing spend.
//!
//! A small pool re-fetches prices for exactly the items in the chosen
//! plan. Price logic can invalidate an item; a failed fetch cannot, the
//! item is kept at its original numbers. With auto-commit on, each valid
//! item gets at most one bid: one task per item, no duplicate dispatch.

use async_trait::async_trait;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::Executor;
use super::fetcher::{RateLimitedFetcher, WorkerLimiter};
use super::pool::{run_pool, Worker};
use crate::config::VerificationConfig;
use crate::sources::{Account, AccountPool};
use crate::types::{Opportunity, PurchasePlan, PurchasePlanItem, SpreadEconomics, VerificationResult};

// ---------------------------------------------------------------------------
// Bid quantization
// ---------------------------------------------------------------------------

fn step_for(price: Decimal) -> Decimal {
    if price < dec!(1) {
        dec!(0.01)
    } else if price < dec!(50) {
        dec!(0.1)
    } else {
        dec!(1)
    }
}

/// Smallest step-aligned price strictly above `price`.
///
/// Steps are 0.01 below 1, 0.1 below 50 and 1 above. The result is rounded
/// to the precision of the bracket it lands in, so 0.999 becomes 1.0.
pub fn bump_price(price: f64) -> f64 {
    let Ok(current) = Decimal::from_str(&format!("{price}")) else {
        return 0.0;
    };
    if current.is_sign_negative() {
        return 0.0;
    }
    let step = step_for(current);
    let bumped = (current / step).floor() * step + step;
    bumped
        .round_dp(step_for(bumped).scale())
        .to_f64()
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
    pub valid: usize,
    pub invalid: usize,
    /// Valid only because the re-fetch failed.
    pub kept_on_failure: usize,
    pub orders_placed: usize,
    pub orders_failed: usize,
    pub cancelled: bool,
}

impl VerificationReport {
    /// Results that produced an order.
    pub fn committed(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results.iter().filter(|r| r.order.is_some())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct VerifyTask {
    item: PurchasePlanItem,
    original_buy: f64,
    original_sell: f64,
}

struct VerifierShared {
    fetcher: Arc<RateLimitedFetcher>,
    executor: Arc<Executor>,
    auto_commit: bool,
    min_profit_rate: f64,
    fee_rate: f64,
}

struct VerifyWorker {
    shared: Arc<VerifierShared>,
    limiter: WorkerLimiter,
    account: Arc<Account>,
}

#[async_trait]
impl Worker for VerifyWorker {
    type Task = VerifyTask;
    type Output = VerificationResult;

    async fn process(&mut self, task: VerifyTask) -> VerificationResult {
        let shared = Arc::clone(&self.shared);
        let id = task.item.id;
        let original = SpreadEconomics::compute(task.original_buy, task.original_sell, shared.fee_rate);

        let mut result = VerificationResult {
            id,
            name: task.item.name.clone(),
            quantity: task.item.quantity,
            original_buy: task.original_buy,
            original_sell: task.original_sell,
            verified_buy: task.original_buy,
            verified_sell: task.original_sell,
            verified_profit_rate: original.profit_rate,
            profit_rate_delta: 0.0,
            still_valid: true,
            reason: None,
            kept_on_fetch_failure: false,
            order: None,
            order_note: None,
        };

        let quote = shared.fetcher.fetch(&mut self.limiter, &self.account, id).await;
        if !quote.ok {
            let reason = quote.failure_reason.unwrap_or_default();
            debug!(item_id = id, reason = %reason, "Re-fetch failed, keeping original prices");
            result.kept_on_fetch_failure = true;
            result.order_note = Some(format!("re-fetch failed: {reason}"));
            return result;
        }

        let econ = SpreadEconomics::compute(quote.buy_price, quote.sell_price, shared.fee_rate);
        result.verified_buy = quote.buy_price;
        result.verified_sell = quote.sell_price;
        result.verified_profit_rate = econ.profit_rate;
        result.profit_rate_delta = econ.profit_rate - original.profit_rate;

        if quote.sell_price <= quote.buy_price {
            result.still_valid = false;
            result.reason = Some("sell no longer above buy".to_string());
        } else if econ.profit_rate < shared.min_profit_rate {
            result.still_valid = false;
            result.reason = Some(format!(
                "profit rate {:.1}% below minimum {:.1}%",
                econ.profit_rate * 100.0,
                shared.min_profit_rate * 100.0
            ));
        }

        if result.still_valid && shared.auto_commit {
            self.commit(&shared, &mut result).await;
        }
        result
    }
}

impl VerifyWorker {
    /// Re-price against the best standing bid and place one order.
    async fn commit(&mut self, shared: &VerifierShared, result: &mut VerificationResult) {
        let best = match shared.fetcher.best_buy(&mut self.limiter, &self.account, result.id).await {
            Ok(side) if side.price > 0.0 => side.price,
            Ok(_) => result.verified_buy,
            Err(e) => {
                debug!(item_id = result.id, error = %e, "Best bid lookup failed, using verified buy");
                result.verified_buy
            }
        };
        let bid = bump_price(best);
        let bid_rate = SpreadEconomics::compute(bid, result.verified_sell, shared.fee_rate).profit_rate;
        if bid_rate < shared.min_profit_rate {
            result.order_note = Some(format!(
                "bumped bid {bid:.2} leaves {:.1}%, below minimum",
                bid_rate * 100.0
            ));
            return;
        }

        match shared
            .executor
            .submit_bid(&self.account, result.id, result.quantity, bid)
            .await
        {
            Ok(receipt) => result.order = Some(receipt),
            Err(e) => result.order_note = Some(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

pub struct VerificationPass {
    fetcher: Arc<RateLimitedFetcher>,
    executor: Arc<Executor>,
    accounts: AccountPool,
    config: VerificationConfig,
    min_profit_rate: f64,
    fee_rate: f64,
}

impl VerificationPass {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        executor: Arc<Executor>,
        accounts: AccountPool,
        config: VerificationConfig,
        min_profit_rate: f64,
        fee_rate: f64,
    ) -> Self {
        Self {
            fetcher,
            executor,
            accounts,
            config,
            min_profit_rate,
            fee_rate,
        }
    }

    /// Re-validate every item of `plan` against live prices.
    ///
    /// `opportunities` supplies the original price pair for each item.
    pub async fn verify(
        &self,
        plan: &PurchasePlan,
        opportunities: &[Opportunity],
        cancel: &CancellationToken,
    ) -> VerificationReport {
        let by_id: HashMap<_, _> = opportunities.iter().map(|o| (o.id, o)).collect();
        let mut seen = HashSet::new();
        let tasks: Vec<VerifyTask> = plan
            .items
            .iter()
            .filter(|item| seen.insert(item.id))
            .map(|item| {
                let (original_buy, original_sell) = by_id
                    .get(&item.id)
                    .map(|o| (o.current_buy_price, o.current_sell_price))
                    .unwrap_or((item.unit_price, item.unit_price));
                VerifyTask {
                    item: item.clone(),
                    original_buy,
                    original_sell,
                }
            })
            .collect();

        if tasks.is_empty() {
            return VerificationReport::default();
        }

        let shared = Arc::new(VerifierShared {
            fetcher: Arc::clone(&self.fetcher),
            executor: Arc::clone(&self.executor),
            auto_commit: self.config.auto_commit,
            min_profit_rate: self.min_profit_rate,
            fee_rate: self.fee_rate,
        });
        let interval = Duration::from_millis(self.config.interval_ms);
        let workers: Vec<VerifyWorker> = (0..self.config.workers.max(1))
            .map(|i| VerifyWorker {
                shared: Arc::clone(&shared),
                limiter: WorkerLimiter::new(interval),
                account: self.accounts.for_worker(i),
            })
            .collect();

        info!(
            items = tasks.len(),
            workers = workers.len(),
            auto_commit = self.config.auto_commit,
            dry_run = self.executor.is_dry_run(),
            "Starting verification"
        );
        let run = run_pool("verification", workers, tasks, cancel).await;

        let mut report = VerificationReport {
            cancelled: run.cancelled,
            ..Default::default()
        };
        for r in run.results {
            if r.still_valid {
                report.valid += 1;
            } else {
                debug!(item_id = r.id, reason = ?r.reason, "Item invalidated");
                report.invalid += 1;
            }
            if r.kept_on_fetch_failure {
                report.kept_on_failure += 1;
            }
            if r.order.is_some() {
                report.orders_placed += 1;
            } else if r.still_valid && self.config.auto_commit && !r.kept_on_fetch_failure {
                if let Some(note) = &r.order_note {
                    warn!(item_id = r.id, note = %note, "No order placed");
                }
                report.orders_failed += 1;
            }
            report.results.push(r);
        }

        info!(
            valid = report.valid,
            invalid = report.invalid,
            kept = report.kept_on_failure,
            orders = report.orders_placed,
            order_failures = report.orders_failed,
            "Verification complete"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
