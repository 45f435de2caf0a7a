//! End-to-end passes over the mock marketplace.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arbiter::config::{AllocationConfig, AppConfig, PositionConfig, VerificationConfig};
use arbiter::engine::enricher::{Blacklist, RejectReason};
use arbiter::engine::executor::Executor;
use arbiter::engine::fetcher::RateLimitedFetcher;
use arbiter::engine::pipeline::Pipeline;
use arbiter::engine::positions::PositionLifecycleManager;
use arbiter::engine::verifier::VerificationPass;
use arbiter::sources::{AccountPool, ForecastSource, OrderRouter, PriceSource};
use arbiter::storage::sqlite::SqliteStore;
use arbiter::storage::{MemoryStore, Persistence};
use arbiter::strategy::allocator::PortfolioAllocator;
use arbiter::types::*;

use crate::mock_market::{list_item, week_of_history, MockMarket};

fn make_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.fetch.per_worker_interval_ms = 10;
    cfg.verification.interval_ms = 10;
    cfg.verification.auto_commit = true;
    cfg.positions.interval_ms = 10;
    cfg.prediction.inter_batch_delay_ms = 0;
    cfg
}

fn make_pipeline(cfg: &AppConfig, store: Arc<dyn Persistence>, market: &Arc<MockMarket>) -> Pipeline {
    let prices: Arc<dyn PriceSource> = market.clone();
    let forecasts: Arc<dyn ForecastSource> = market.clone();
    let router: Arc<dyn OrderRouter> = market.clone();
    Pipeline::new(
        cfg,
        store,
        prices,
        forecasts,
        Arc::new(Executor::new(Some(router), false)),
        AccountPool::new(Vec::new()),
        Blacklist::empty(),
    )
}

fn make_opportunity(id: ItemId, price: f64, sell: f64, score: f64) -> Opportunity {
    let econ = SpreadEconomics::compute(price, sell, 0.0);
    Opportunity {
        id,
        name: format!("item {id}"),
        current_buy_price: price,
        current_sell_price: sell,
        avg_buy_price_7d: price,
        avg_sell_price_7d: sell,
        profit_rate: econ.profit_rate,
        estimated_profit: econ.profit,
        trend: Trend::Stable,
        risk: RiskLevel::Medium,
        buy_order_count: 20,
        sell_order_count: 200,
        days_of_data: 7,
        rank: None,
        score,
        recommended_buy_price: price,
        recommended_quantity: 1,
        analysed_at: Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_pass_commits_and_opens_positions() {
    let store = Arc::new(MemoryStore::new());
    let market = Arc::new(MockMarket::new());

    // Clean 18.8% spread with an upward forecast.
    list_item(&store, 1, "AK-47 | Redline (Field-Tested)", 10.0, 12.0);
    market.quote(1, 10.0, 12.0);
    market.forecast(1, 12.0, 13.0);
    // Excluded category.
    list_item(&store, 2, "Sticker | Crown (Foil)", 10.0, 12.0);
    market.quote(2, 10.0, 12.0);
    // Margin too thin.
    list_item(&store, 3, "M4A4 | Desolate Space (Minimal Wear)", 10.0, 10.5);
    market.quote(3, 10.0, 10.5);
    // Forecast falls; dropped before any price fetch.
    list_item(&store, 4, "AWP | Atheris (Field-Tested)", 10.0, 12.0);
    market.quote(4, 10.0, 12.0);
    market.forecast(4, 12.0, 11.0);
    // Live price unavailable; history carries it through enrichment.
    list_item(&store, 5, "Glock-18 | Vogue (Field-Tested)", 10.0, 12.0);
    market.fail_prices(5);

    let cfg = make_config();
    let pipeline = make_pipeline(&cfg, store.clone(), &market);
    let report = pipeline.run_pass(1, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.universe, 5);
    assert_eq!(report.coarse_rejected, 1);
    assert_eq!(report.enriched, 2);
    assert_eq!(report.enrich_rejected, 2);
    assert_eq!(report.rejections.get(&RejectReason::ExcludedCategory), Some(&1));
    assert_eq!(report.rejections.get(&RejectReason::BelowMinProfit), Some(&1));
    assert_eq!(report.fallback_quotes, 1);
    assert_eq!(report.opportunities, 2);
    assert_eq!(report.plan_items, 2);
    assert!(report.plan_cost <= cfg.allocation.budget);

    // Item 5 is kept on the failed re-fetch but gets no order.
    assert_eq!(report.verified_valid, 2);
    assert_eq!(report.kept_on_failure, 1);
    assert_eq!(report.orders_committed, 1);
    assert_eq!(report.positions_opened, 1);
    assert!(!report.cancelled);

    let bids = market.bids();
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].0, 1);
    assert_eq!(bids[0].3, 10.1);

    assert_eq!(store.opportunities().len(), 2);
    assert_eq!(store.plans().len(), 1);
    let positions = store.positions();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].item_id, 1);
    assert_eq!(positions[0].status, PositionStatus::Holding);
    assert_eq!(positions[0].buy_price, 10.1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_pass_keeps_previous_set() {
    let store = Arc::new(MemoryStore::new());
    let market = Arc::new(MockMarket::new());
    list_item(&store, 1, "AK-47 | Redline (Field-Tested)", 10.0, 12.0);
    market.quote(1, 10.0, 12.0);

    let cfg = make_config();
    let pipeline = make_pipeline(&cfg, store.clone(), &market);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = pipeline.run_pass(1, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(market.bids().is_empty());
    assert_eq!(store.archive_len(), 0);
}

#[test]
fn test_best_of_four_orderings() {
    // Costs 50, 80 and 120 against a budget of 100: the cheapest item has
    // the best score, the 80 one the best feasible profit.
    let opps = vec![
        make_opportunity(1, 50.0, 55.0, 90.0),
        make_opportunity(2, 80.0, 94.0, 50.0),
        make_opportunity(3, 120.0, 140.0, 40.0),
    ];
    let allocator = PortfolioAllocator::new(
        AllocationConfig {
            budget: 100.0,
            ..AllocationConfig::default()
        },
        0.0,
    );

    let selection = allocator.best_plan(&opps);
    assert_eq!(selection.candidates.len(), 4);
    for plan in &selection.candidates {
        assert!(plan.total_cost <= 100.0);
        assert!(plan.items.iter().all(|i| i.id != 3));
    }

    let best_profit = selection
        .candidates
        .iter()
        .map(|p| p.total_profit)
        .fold(f64::MIN, f64::max);
    assert_eq!(selection.best.total_profit, best_profit);
    assert_eq!(selection.best.items.len(), 1);
    assert_eq!(selection.best.items[0].id, 2);
    assert!((selection.best.total_profit - 14.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_stop_loss_after_one_sweep() {
    let store = Arc::new(MemoryStore::new());
    let market = Arc::new(MockMarket::new());
    market.quote(7, 8.0, 9.0);

    let position = HoldingPosition {
        id: 0,
        item_id: 7,
        name: "USP-S | Cortex (Field-Tested)".into(),
        buy_price: 10.0,
        buy_quantity: 3,
        sold_quantity: 1,
        buy_time: Utc::now() - ChronoDuration::days(2),
        current_price: 11.0,
        target_profit_rate: 0.08,
        max_loss_rate: -0.05,
        status: PositionStatus::PartialSold,
        realized_profit: 0.8,
        risk: RiskLevel::Medium,
        last_sold_price: Some(11.0),
        last_sold_at: Some(Utc::now() - ChronoDuration::days(1)),
    };
    store.save_position(&position).await.unwrap();

    let prices: Arc<dyn PriceSource> = market.clone();
    let router: Arc<dyn OrderRouter> = market.clone();
    let manager = PositionLifecycleManager::new(
        Arc::new(RateLimitedFetcher::new(prices, Duration::from_secs(5))),
        Arc::new(Executor::new(Some(router), false)),
        store.clone(),
        AccountPool::new(Vec::new()),
        PositionConfig {
            interval_ms: 10,
            ..PositionConfig::default()
        },
        0.01,
    );

    let report = manager.sweep(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.stop_loss, 1);

    let p = &store.positions()[0];
    assert_eq!(p.status, PositionStatus::StopLoss);
    assert_eq!(p.sold_quantity, p.buy_quantity);
    assert_eq!(market.orders(), vec![(7, OrderSide::Sell, 2, 9.0)]);

    // Terminal positions are not swept again.
    let report = manager.sweep(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test(start_paused = true)]
async fn test_verification_keeps_items_on_fetch_failure() {
    let market = Arc::new(MockMarket::new());
    market.fail_prices(1);
    market.quote(2, 12.5, 12.0);

    let opps = vec![
        make_opportunity(1, 10.0, 12.0, 60.0),
        make_opportunity(2, 10.0, 12.0, 55.0),
    ];
    let allocator = PortfolioAllocator::new(AllocationConfig::default(), 0.01);
    let plan = allocator.allocate(&opps, 1000.0, PlanOrdering::Score);

    let prices: Arc<dyn PriceSource> = market.clone();
    let pass = VerificationPass::new(
        Arc::new(RateLimitedFetcher::new(prices, Duration::from_secs(5))),
        Arc::new(Executor::simulated()),
        AccountPool::new(Vec::new()),
        VerificationConfig {
            interval_ms: 10,
            auto_commit: true,
            ..VerificationConfig::default()
        },
        0.08,
        0.01,
    );
    let report = pass.verify(&plan, &opps, &CancellationToken::new()).await;

    let kept = report.results.iter().find(|r| r.id == 1).unwrap();
    assert!(kept.still_valid);
    assert!(kept.kept_on_fetch_failure);
    assert_eq!((kept.verified_buy, kept.verified_sell), (10.0, 12.0));
    assert!(kept.order.is_none());

    let inverted = report.results.iter().find(|r| r.id == 2).unwrap();
    assert!(!inverted.still_valid);
    assert_eq!(report.committed().count(), 0);
}

#[tokio::test]
async fn test_sqlite_pass_replaces_live_set() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteStore::open(&dir.path().join("arbiter.db")).await.unwrap();
    sqlite.upsert_item(&Item::new(1, "AK-47 | Redline (Field-Tested)")).await.unwrap();
    for snap in week_of_history(1, 10.0, 12.0) {
        sqlite.insert_snapshot(&snap).await.unwrap();
    }
    let sqlite = Arc::new(sqlite);

    let market = Arc::new(MockMarket::new());
    market.quote(1, 10.0, 12.0);

    let mut cfg = make_config();
    cfg.prediction.enabled = false;
    cfg.verification.auto_commit = false;
    let pipeline = make_pipeline(&cfg, sqlite.clone(), &market);

    let first = pipeline.run_pass(1, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.opportunities, 1);
    assert_eq!(sqlite.load_opportunities().await.unwrap().len(), 1);
    assert_eq!(sqlite.archived_count().await.unwrap(), 0);

    pipeline.run_pass(2, &CancellationToken::new()).await.unwrap();
    assert_eq!(sqlite.load_opportunities().await.unwrap().len(), 1);
    assert_eq!(sqlite.archived_count().await.unwrap(), 1);
    assert!(market.bids().is_empty());
}
