//! Held-inventory lifecycle.
//!
//! A periodic sweep re-prices every open position and applies the exit
//! rules in a fixed order: take-profit, then stop-loss, then the forced
//! time exit. Every rule sees the state the previous one left, so a later
//! rule may close out what an earlier one only partially sold. A sale is
//! booked only after the executor accepts it, and the position is saved
//! before the worker moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::Executor;
use super::fetcher::{RateLimitedFetcher, WorkerLimiter};
use super::pool::{run_pool, Worker};
use crate::config::PositionConfig;
use crate::sources::{Account, AccountPool};
use crate::storage::Persistence;
use crate::types::{HoldingPosition, Opportunity, PositionStatus, RiskLevel};

// ---------------------------------------------------------------------------
// Opening
// ---------------------------------------------------------------------------

/// Target and max-loss rates for a risk tier.
pub fn risk_preset(risk: RiskLevel) -> (f64, f64) {
    match risk {
        RiskLevel::Low => (0.10, -0.10),
        RiskLevel::Medium => (0.08, -0.05),
        RiskLevel::High => (0.06, -0.02),
    }
}

/// A fresh `holding` position for a committed bid.
pub fn open_position(opp: &Opportunity, quantity: u32, price: f64, now: DateTime<Utc>) -> HoldingPosition {
    let (target_profit_rate, max_loss_rate) = risk_preset(opp.risk);
    HoldingPosition {
        id: 0,
        item_id: opp.id,
        name: opp.name.clone(),
        buy_price: price,
        buy_quantity: quantity,
        sold_quantity: 0,
        buy_time: now,
        current_price: opp.current_sell_price,
        target_profit_rate,
        max_loss_rate,
        status: PositionStatus::Holding,
        realized_profit: 0.0,
        risk: opp.risk,
        last_sold_price: None,
        last_sold_at: None,
    }
}

/// `max(1, floor(quantity × fraction))`, capped by `quantity`.
fn sell_quantity(quantity: u32, fraction: f64) -> u32 {
    let units = (f64::from(quantity) * fraction).floor() as u32;
    units.max(1).min(quantity)
}

// ---------------------------------------------------------------------------
// Sweep report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaleKind {
    Partial,
    Full,
    StopLoss,
    TimeExit,
}

impl SaleKind {
    fn as_str(&self) -> &'static str {
        match self {
            SaleKind::Partial => "partial_take_profit",
            SaleKind::Full => "take_profit",
            SaleKind::StopLoss => "stop_loss",
            SaleKind::TimeExit => "time_exit",
        }
    }
}

#[derive(Debug, Default)]
struct SweepOutcome {
    skipped: bool,
    sales: Vec<SaleKind>,
    failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Positions whose price could not be fetched.
    pub skipped: usize,
    pub partial: usize,
    pub full: usize,
    pub stop_loss: usize,
    pub time_exit: usize,
    /// Sales the executor rejected.
    pub failed: usize,
    pub cancelled: bool,
}

impl SweepReport {
    fn record(&mut self, outcome: SweepOutcome) {
        self.examined += 1;
        if outcome.skipped {
            self.skipped += 1;
        }
        for sale in outcome.sales {
            match sale {
                SaleKind::Partial => self.partial += 1,
                SaleKind::Full => self.full += 1,
                SaleKind::StopLoss => self.stop_loss += 1,
                SaleKind::TimeExit => self.time_exit += 1,
            }
        }
        self.failed += outcome.failed;
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct SweepShared {
    fetcher: Arc<RateLimitedFetcher>,
    executor: Arc<Executor>,
    store: Arc<dyn Persistence>,
    config: PositionConfig,
    fee_rate: f64,
    now: DateTime<Utc>,
}

struct SweepWorker {
    shared: Arc<SweepShared>,
    limiter: WorkerLimiter,
    account: Arc<Account>,
}

#[async_trait]
impl Worker for SweepWorker {
    type Task = HoldingPosition;
    type Output = SweepOutcome;

    async fn process(&mut self, mut position: HoldingPosition) -> SweepOutcome {
        let shared = Arc::clone(&self.shared);
        let mut outcome = SweepOutcome::default();

        let quote = shared.fetcher.fetch(&mut self.limiter, &self.account, position.item_id).await;
        if !quote.ok {
            debug!(
                item_id = position.item_id,
                reason = quote.failure_reason.as_deref().unwrap_or(""),
                "Position price unavailable, skipping"
            );
            outcome.skipped = true;
            return outcome;
        }

        let price = quote.sell_price;
        position.current_price = price;
        let rate = position.profit_rate_at(price, shared.fee_rate);
        let cfg = &shared.config;

        // Take-profit: a fresh position past the full target takes both steps.
        if position.sold_quantity == 0 && rate >= position.target_profit_rate * cfg.partial_trigger {
            let qty = sell_quantity(position.buy_quantity, cfg.first_sell_fraction);
            let next = if qty >= position.remaining() {
                PositionStatus::FullySold
            } else {
                PositionStatus::PartialSold
            };
            self.sell(&mut position, &mut outcome, SaleKind::Partial, qty, price, next).await;
        }
        if position.status == PositionStatus::PartialSold && rate >= position.target_profit_rate {
            let qty = sell_quantity(position.remaining(), cfg.second_sell_fraction);
            let next = if qty >= position.remaining() {
                PositionStatus::FullySold
            } else {
                PositionStatus::PartialSold
            };
            self.sell(&mut position, &mut outcome, SaleKind::Full, qty, price, next).await;
        }

        if !position.status.is_terminal() && rate <= position.max_loss_rate {
            let qty = position.remaining();
            self.sell(&mut position, &mut outcome, SaleKind::StopLoss, qty, price, PositionStatus::StopLoss)
                .await;
        }

        if !position.status.is_terminal() && position.days_held(shared.now) > cfg.max_hold_days {
            let qty = position.remaining();
            self.sell(&mut position, &mut outcome, SaleKind::TimeExit, qty, price, PositionStatus::FullySold)
                .await;
        }

        if let Err(e) = shared.store.save_position(&position).await {
            warn!(item_id = position.item_id, error = %e, "Failed to save position");
        }
        outcome
    }
}

impl SweepWorker {
    async fn sell(
        &self,
        position: &mut HoldingPosition,
        outcome: &mut SweepOutcome,
        kind: SaleKind,
        quantity: u32,
        price: f64,
        next: PositionStatus,
    ) {
        let shared = &self.shared;
        if let Err(e) = shared.executor.submit_sell(&self.account, position, quantity, price).await {
            warn!(item_id = position.item_id, rule = kind.as_str(), error = %e, "Sale not placed");
            outcome.failed += 1;
            return;
        }
        match position.record_sale(quantity, price, shared.fee_rate, next, shared.now) {
            Ok(units) => {
                info!(
                    item_id = position.item_id,
                    rule = kind.as_str(),
                    units,
                    price = format!("{:.2}", price),
                    status = %position.status,
                    realized = format!("{:.2}", position.realized_profit),
                    "Position sale booked"
                );
                outcome.sales.push(kind);
            }
            Err(e) => {
                warn!(item_id = position.item_id, error = %e, "Sale rejected by position state");
                outcome.failed += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct PositionLifecycleManager {
    fetcher: Arc<RateLimitedFetcher>,
    executor: Arc<Executor>,
    store: Arc<dyn Persistence>,
    accounts: AccountPool,
    config: PositionConfig,
    fee_rate: f64,
}

impl PositionLifecycleManager {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        executor: Arc<Executor>,
        store: Arc<dyn Persistence>,
        accounts: AccountPool,
        config: PositionConfig,
        fee_rate: f64,
    ) -> Self {
        Self {
            fetcher,
            executor,
            store,
            accounts,
            config,
            fee_rate,
        }
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// Persist a newly opened position.
    pub async fn open(&self, position: &HoldingPosition) -> anyhow::Result<i64> {
        let id = self.store.save_position(position).await?;
        info!(
            id,
            item_id = position.item_id,
            quantity = position.buy_quantity,
            price = format!("{:.2}", position.buy_price),
            target = format!("{:.1}%", position.target_profit_rate * 100.0),
            "Position opened"
        );
        Ok(id)
    }

    /// Run every exit rule once over all open positions.
    pub async fn sweep(&self, cancel: &CancellationToken) -> anyhow::Result<SweepReport> {
        let open = self
            .store
            .load_positions(&[PositionStatus::Holding, PositionStatus::PartialSold])
            .await?;
        if open.is_empty() {
            debug!("No open positions");
            return Ok(SweepReport::default());
        }

        let shared = Arc::new(SweepShared {
            fetcher: Arc::clone(&self.fetcher),
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            fee_rate: self.fee_rate,
            now: Utc::now(),
        });
        let interval = Duration::from_millis(self.config.interval_ms);
        let workers: Vec<SweepWorker> = (0..self.config.workers.max(1))
            .map(|i| SweepWorker {
                shared: Arc::clone(&shared),
                limiter: WorkerLimiter::new(interval),
                account: self.accounts.for_worker(i),
            })
            .collect();

        let run = run_pool("position_sweep", workers, open, cancel).await;
        let mut report = SweepReport {
            cancelled: run.cancelled,
            ..Default::default()
        };
        for outcome in run.results {
            report.record(outcome);
        }

        info!(
            examined = report.examined,
            skipped = report.skipped,
            partial = report.partial,
            full = report.full,
            stop_loss = report.stop_loss,
            time_exit = report.time_exit,
            failed = report.failed,
            "Position sweep complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
