//! Pass orchestrator.
//!
//! Stages run strictly in sequence; each one sees the complete output of
//! the one before it. Every stage gets its own cancellation token, a
//! child of the pass token, that also fires when the stage deadline
//! passes. A stage that hits its deadline stops pulling new work and the
//! pass continues with whatever it produced.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::enricher::{Blacklist, ConcurrentEnrichmentPool, RejectReason};
use super::executor::Executor;
use super::fetcher::RateLimitedFetcher;
use super::positions::{open_position, PositionLifecycleManager};
use super::predictor::{retain_upside, PredictionBatcher};
use super::verifier::VerificationPass;
use crate::config::{AppConfig, PipelineConfig, PredictionConfig};
use crate::sources::{AccountPool, ForecastSource, PriceSource};
use crate::storage::Persistence;
use crate::strategy::allocator::PortfolioAllocator;
use crate::strategy::OpportunityBuilder;
use crate::types::{Forecast, ItemId};

// ---------------------------------------------------------------------------
// Pass report
// ---------------------------------------------------------------------------

/// Summary counts of one pass, from universe to committed orders.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub pass_number: u64,
    pub universe: usize,
    pub coarse_kept: usize,
    pub coarse_rejected: usize,
    pub enriched: usize,
    pub enrich_rejected: usize,
    pub rejections: BTreeMap<RejectReason, usize>,
    pub live_quotes: u64,
    pub fallback_quotes: u64,
    pub precise_success: usize,
    pub precise_errors: usize,
    pub opportunities: usize,
    pub plan_label: Option<&'static str>,
    pub plan_items: usize,
    pub plan_cost: f64,
    pub plan_profit: f64,
    pub verified_valid: usize,
    pub verified_invalid: usize,
    pub kept_on_failure: usize,
    pub orders_committed: usize,
    pub orders_failed: usize,
    pub positions_opened: usize,
    /// A stage deadline or shutdown cut the pass short.
    pub cancelled: bool,
    pub duration: Duration,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Stage deadline
// ---------------------------------------------------------------------------

/// Child token that is also cancelled once `timeout` elapses.
struct StageDeadline {
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl StageDeadline {
    fn start(parent: &CancellationToken, stage: &'static str, timeout: Duration) -> Self {
        let token = parent.child_token();
        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(stage, timeout_secs = timeout.as_secs(), "Stage deadline reached, stopping new work");
                    timer_token.cancel();
                }
                _ = timer_token.cancelled() => {}
            }
        });
        Self { token, timer }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for StageDeadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    store: Arc<dyn Persistence>,
    predictor: Option<PredictionBatcher>,
    enrichment: ConcurrentEnrichmentPool,
    builder: OpportunityBuilder,
    allocator: PortfolioAllocator,
    verifier: VerificationPass,
    positions: Arc<PositionLifecycleManager>,
    config: PipelineConfig,
    prediction: PredictionConfig,
}

impl Pipeline {
    /// Wire every stage from one configuration. All live-price stages
    /// share a single fetcher so its counters cover the whole process.
    pub fn new(
        cfg: &AppConfig,
        store: Arc<dyn Persistence>,
        prices: Arc<dyn PriceSource>,
        forecasts: Arc<dyn ForecastSource>,
        executor: Arc<Executor>,
        accounts: AccountPool,
        blacklist: Blacklist,
    ) -> Self {
        let fee_rate = cfg.filters.fee_rate;
        let fetcher = Arc::new(RateLimitedFetcher::new(
            prices,
            Duration::from_secs(cfg.fetch.request_timeout_secs),
        ));

        let predictor = cfg.prediction.enabled.then(|| {
            PredictionBatcher::new(forecasts, Duration::from_millis(cfg.prediction.inter_batch_delay_ms))
        });
        let enrichment = ConcurrentEnrichmentPool::new(
            Arc::clone(&fetcher),
            Arc::clone(&store),
            accounts.clone(),
            blacklist,
            cfg.filters.clone(),
            cfg.enrichment.clone(),
            Duration::from_millis(cfg.fetch.per_worker_interval_ms),
        );
        let verifier = VerificationPass::new(
            Arc::clone(&fetcher),
            Arc::clone(&executor),
            accounts.clone(),
            cfg.verification.clone(),
            cfg.filters.min_profit_rate,
            fee_rate,
        );
        let positions = Arc::new(PositionLifecycleManager::new(
            fetcher,
            executor,
            Arc::clone(&store),
            accounts,
            cfg.positions.clone(),
            fee_rate,
        ));

        Self {
            store,
            predictor,
            enrichment,
            builder: OpportunityBuilder::new(cfg.filters.clone(), cfg.prediction.horizon_days),
            allocator: PortfolioAllocator::new(cfg.allocation.clone(), fee_rate),
            verifier,
            positions,
            config: cfg.pipeline.clone(),
            prediction: cfg.prediction.clone(),
        }
    }

    /// Handle for the independent position sweeper.
    pub fn positions(&self) -> Arc<PositionLifecycleManager> {
        Arc::clone(&self.positions)
    }

    /// Re-read the blacklist file before the next pass.
    pub fn refresh_blacklist(&mut self) -> Result<usize> {
        self.enrichment.refresh_blacklist()
    }

    fn stage(&self, cancel: &CancellationToken, stage: &'static str) -> StageDeadline {
        StageDeadline::start(cancel, stage, Duration::from_secs(self.config.stage_timeout_secs))
    }

    /// Run one full pass. Only a catalog load failure is an error; every
    /// other failure degrades into the report counts.
    pub async fn run_pass(&self, pass_number: u64, cancel: &CancellationToken) -> Result<PassReport> {
        let started = Instant::now();
        let mut report = PassReport {
            pass_number,
            ..Default::default()
        };
        info!(pass = pass_number, "Starting pass");

        self.execute(&mut report, cancel).await?;

        report.cancelled |= cancel.is_cancelled();
        report.duration = started.elapsed();
        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    async fn execute(&self, report: &mut PassReport, cancel: &CancellationToken) -> Result<()> {
        let horizon = self.prediction.horizon_days;

        // -- Universe --------------------------------------------------------
        let catalog = self.store.load_catalog().await.context("Failed to load catalog")?;
        report.universe = catalog.len();
        if catalog.is_empty() {
            info!("Catalog is empty, nothing to do");
            return Ok(());
        }

        // -- Coarse forecast -------------------------------------------------
        let items = match &self.predictor {
            Some(predictor) => {
                let ids: Vec<ItemId> = catalog.iter().map(|i| i.id).collect();
                let stage = self.stage(cancel, "coarse_forecast");
                let coarse = predictor
                    .predict(
                        "coarse_forecast",
                        &ids,
                        self.prediction.coarse_batch_size,
                        self.prediction.coarse_concurrency,
                        horizon,
                        stage.token(),
                    )
                    .await;
                report.cancelled |= coarse.cancelled;
                let kept: HashSet<ItemId> =
                    retain_upside(&ids, &coarse.forecasts, horizon, self.prediction.min_upside)
                        .into_iter()
                        .collect();
                catalog.into_iter().filter(|i| kept.contains(&i.id)).collect()
            }
            None => catalog,
        };
        report.coarse_kept = items.len();
        report.coarse_rejected = report.universe - items.len();
        if cancel.is_cancelled() {
            return Ok(());
        }

        // -- Enrichment ------------------------------------------------------
        let enrichment = {
            let stage = self.stage(cancel, "enrichment");
            self.enrichment.enrich(items, stage.token()).await
        };
        report.cancelled |= enrichment.cancelled;
        report.enriched = enrichment.survivors.len();
        report.enrich_rejected = enrichment.rejected;
        report.rejections = enrichment.rejections.clone();
        report.live_quotes = enrichment.live_quotes;
        report.fallback_quotes = enrichment.fallback_quotes;
        if cancel.is_cancelled() {
            return Ok(());
        }

        // -- Precise forecast ------------------------------------------------
        let forecasts: HashMap<ItemId, Forecast> = match &self.predictor {
            Some(predictor) if !enrichment.survivors.is_empty() => {
                let ids: Vec<ItemId> = enrichment.survivors.iter().map(|c| c.item.id).collect();
                let stage = self.stage(cancel, "precise_forecast");
                let precise = predictor
                    .predict(
                        "precise_forecast",
                        &ids,
                        self.prediction.precise_batch_size,
                        self.prediction.precise_concurrency,
                        horizon,
                        stage.token(),
                    )
                    .await;
                report.cancelled |= precise.cancelled;
                report.precise_success = precise.success_count;
                report.precise_errors = precise.error_count;
                precise.forecasts
            }
            _ => HashMap::new(),
        };

        // -- Analysis --------------------------------------------------------
        let (mut opportunities, decisions) = self.builder.build_all(&enrichment.survivors, &forecasts);
        debug!(decisions = decisions.len(), "Analysis decisions recorded");
        let budget = self.allocator.budget();
        for opp in &mut opportunities {
            opp.recommended_quantity = self.allocator.calculate_optimal_quantity(opp, budget);
        }
        report.opportunities = opportunities.len();

        // A cut-short pass must not replace a complete live set.
        if report.cancelled {
            warn!("Pass incomplete, keeping the previous opportunity set");
        } else if let Err(e) = self.store.save_opportunities(&opportunities).await {
            warn!(error = %e, "Failed to persist opportunities");
        }
        if opportunities.is_empty() || cancel.is_cancelled() {
            return Ok(());
        }

        // -- Allocation ------------------------------------------------------
        let selection = self.allocator.best_plan(&opportunities);
        let plan = selection.best;
        report.plan_label = Some(plan.ordering.label());
        report.plan_items = plan.items.len();
        report.plan_cost = plan.total_cost;
        report.plan_profit = plan.total_profit;
        info!(plan = %plan, "Plan selected");
        if plan.is_empty() {
            return Ok(());
        }

        // -- Verification and commit -----------------------------------------
        let verification = {
            let stage = self.stage(cancel, "verification");
            self.verifier.verify(&plan, &opportunities, stage.token()).await
        };
        report.cancelled |= verification.cancelled;
        report.verified_valid = verification.valid;
        report.verified_invalid = verification.invalid;
        report.kept_on_failure = verification.kept_on_failure;
        report.orders_committed = verification.orders_placed;
        report.orders_failed = verification.orders_failed;

        if let Err(e) = self.store.save_plan(&plan, &verification.results).await {
            warn!(error = %e, "Failed to persist plan");
        }

        // -- Positions -------------------------------------------------------
        if self.positions.config().open_on_commit {
            let by_id: HashMap<ItemId, _> = opportunities.iter().map(|o| (o.id, o)).collect();
            let now = Utc::now();
            for result in verification.committed() {
                let (Some(receipt), Some(opp)) = (&result.order, by_id.get(&result.id)) else {
                    continue;
                };
                let position = open_position(opp, receipt.quantity, receipt.price, now);
                match self.positions.open(&position).await {
                    Ok(_) => report.positions_opened += 1,
                    Err(e) => warn!(item_id = result.id, error = %e, "Failed to open position"),
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
