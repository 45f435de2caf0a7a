//! ARBITER: marketplace spread arbitrage pipeline
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens storage, and runs the pass loop alongside an independent
//! position sweeper until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arbiter::config;
use arbiter::engine::enricher::Blacklist;
use arbiter::engine::executor::Executor;
use arbiter::engine::pipeline::{PassReport, Pipeline};
use arbiter::engine::positions::PositionLifecycleManager;
use arbiter::sources::forecast::HttpForecastClient;
use arbiter::sources::gateway::HttpPriceGateway;
use arbiter::sources::{AccountPool, ForecastSource, OrderRouter, PriceSource};
use arbiter::storage::sqlite::SqliteStore;
use arbiter::storage::Persistence;

const BANNER: &str = r#"
    _    ____  ____ ___ _____ _____ ____
   / \  |  _ \| __ )_ _|_   _| ____|  _ \
  / _ \ | |_) |  _ \| |  | | |  _| | |_) |
 / ___ \|  _ <| |_) | |  | | | |___|  _ <
/_/   \_\_| \_\____/___| |_| |_____|_| \_\

  Marketplace spread arbitrage pipeline
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");
    info!(
        name = %cfg.pipeline.name,
        pass_interval_secs = cfg.pipeline.pass_interval_secs,
        budget = format!("{:.2}", cfg.allocation.budget),
        min_profit = format!("{:.1}%", cfg.filters.min_profit_rate * 100.0),
        "ARBITER starting up"
    );

    // -- Storage (the only fatal failure) ---------------------------------

    let store: Arc<dyn Persistence> = match SqliteStore::connect(&cfg.storage.database_url).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(url = %cfg.storage.database_url, error = %format!("{e:#}"), "Failed to initialise storage");
            return Err(e);
        }
    };

    // -- Collaborators ----------------------------------------------------

    let accounts = AccountPool::from_config(&cfg.accounts);
    let gateway = Arc::new(HttpPriceGateway::new(
        &cfg.sources.gateway_url,
        Duration::from_secs(cfg.fetch.request_timeout_secs),
    )?);
    let forecaster = HttpForecastClient::new(
        &cfg.sources.forecast_url,
        Duration::from_secs(cfg.sources.forecast_timeout_secs),
    )?;
    if cfg.prediction.enabled && !forecaster.health().await {
        warn!(url = %cfg.sources.forecast_url, "Forecast service not responding, passes will run without forecasts");
    }

    let live = cfg.pipeline.live_orders && accounts.has_credentials();
    if cfg.pipeline.live_orders && !live {
        warn!("Live orders requested but no account has credentials, running dry");
    }
    let router: Arc<dyn OrderRouter> = gateway.clone();
    let executor = Arc::new(Executor::new(Some(router), !live));
    info!(accounts = accounts.len(), dry_run = executor.is_dry_run(), "Executor ready");

    let blacklist = match cfg.enrichment.blacklist_path.as_deref() {
        Some(path) => Blacklist::load_or_empty(path),
        None => Blacklist::empty(),
    };

    let prices: Arc<dyn PriceSource> = gateway;
    let forecasts: Arc<dyn ForecastSource> = Arc::new(forecaster);
    let mut pipeline = Pipeline::new(&cfg, store, prices, forecasts, executor, accounts, blacklist);

    // -- Runtime ----------------------------------------------------------

    let shutdown = CancellationToken::new();

    let sweeper = if cfg.positions.enabled {
        Some(tokio::spawn(run_sweeper(
            pipeline.positions(),
            Duration::from_secs(cfg.positions.sweep_interval_secs),
            shutdown.clone(),
        )))
    } else {
        None
    };

    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received.");
            ctrl_c_token.cancel();
        }
    });

    let pass_interval = Duration::from_secs(cfg.pipeline.pass_interval_secs);
    info!(
        interval_secs = cfg.pipeline.pass_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    let mut pass_number = 0u64;
    while !shutdown.is_cancelled() {
        pass_number += 1;
        if let Err(e) = pipeline.refresh_blacklist() {
            warn!(error = %format!("{e:#}"), "Blacklist refresh failed, keeping previous list");
        }

        let pass_token = shutdown.child_token();
        match pipeline.run_pass(pass_number, &pass_token).await {
            Ok(report) => log_pass_report(&report),
            Err(e) => error!(pass = pass_number, error = %format!("{e:#}"), "Pass failed, continuing to next"),
        }

        tokio::select! {
            _ = tokio::time::sleep(pass_interval) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            warn!(error = %e, "Position sweeper ended abnormally");
        }
    }
    info!(passes = pass_number, "ARBITER shut down cleanly.");
    Ok(())
}

/// Sweep open positions on a fixed cadence until shutdown.
async fn run_sweeper(manager: Arc<PositionLifecycleManager>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = manager.sweep(&shutdown.child_token()).await {
                    error!(error = %format!("{e:#}"), "Position sweep failed");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Log a human-readable pass summary.
fn log_pass_report(report: &PassReport) {
    let rejections: Vec<String> = report
        .rejections
        .iter()
        .map(|(reason, n)| format!("{reason}={n}"))
        .collect();
    info!(
        pass = report.pass_number,
        universe = report.universe,
        coarse_kept = report.coarse_kept,
        coarse_rejected = report.coarse_rejected,
        enriched = report.enriched,
        rejected = report.enrich_rejected,
        rejections = %rejections.join(","),
        live_quotes = report.live_quotes,
        fallback_quotes = report.fallback_quotes,
        forecasts = report.precise_success,
        forecast_errors = report.precise_errors,
        opportunities = report.opportunities,
        plan = report.plan_label.unwrap_or("none"),
        plan_items = report.plan_items,
        plan_cost = format!("{:.2}", report.plan_cost),
        plan_profit = format!("{:.2}", report.plan_profit),
        valid = report.verified_valid,
        invalid = report.verified_invalid,
        kept = report.kept_on_failure,
        committed = report.orders_committed,
        order_failures = report.orders_failed,
        positions_opened = report.positions_opened,
        cancelled = report.cancelled,
        duration_ms = report.duration.as_millis() as u64,
        "Pass complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("arbiter=info"));

    let json_logging = std::env::var("ARBITER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
