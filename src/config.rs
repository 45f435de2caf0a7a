//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed sections, one
//! per pipeline stage. Every section has production defaults, so a partial
//! file is valid. Secrets (marketplace tokens) are referenced by env-var
//! name in the config and resolved at start-up.
//!
//! The resulting `AppConfig` is built once and handed to stage constructors
//! by value; nothing reads configuration from global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::types::ArbError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub filters: FilterConfig,
    pub fetch: FetchConfig,
    pub enrichment: EnrichmentConfig,
    pub prediction: PredictionConfig,
    pub allocation: AllocationConfig,
    pub verification: VerificationConfig,
    pub positions: PositionConfig,
    pub storage: StorageConfig,
    pub sources: SourcesConfig,
    pub accounts: Vec<AccountConfig>,
}

/// Outer loop cadence and per-stage deadlines.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    /// Cool-down between the end of one pass and the start of the next.
    pub pass_interval_secs: u64,
    /// A stage still running after this long stops pulling new work.
    pub stage_timeout_secs: u64,
    /// Place real orders; otherwise the executor runs dry.
    pub live_orders: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "ARBITER-001".to_string(),
            pass_interval_secs: 300,
            stage_timeout_secs: 1800,
            live_orders: false,
        }
    }
}

/// Market filters and spread economics shared by several stages.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    pub fee_rate: f64,
    pub min_profit_rate: f64,
    pub min_days_history: u32,
    pub min_sell_count: u32,
    pub min_buy_count: u32,
    pub min_price: f64,
    pub max_reasonable_price: f64,
    /// Sell may not exceed buy by more than this multiple.
    pub max_price_spread: f64,
    /// Name fragments that exclude an item outright (case-insensitive).
    pub excluded_keywords: Vec<String>,
    /// Name fragments marking high-demand weapon families.
    pub popular_keywords: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.01,
            min_profit_rate: 0.08,
            min_days_history: 7,
            min_sell_count: 90,
            min_buy_count: 5,
            min_price: 2.0,
            max_reasonable_price: 300.0,
            max_price_spread: 2.0,
            excluded_keywords: [
                "★", "gloves", "sticker", "patch", "agent", "music kit", "souvenir",
                "case", "capsule", "graffiti", "pass", "charm",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            popular_keywords: [
                "AK-47", "M4A4", "M4A1-S", "AWP", "USP-S", "Glock-18", "Desert Eagle",
                "P250", "CZ75",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Live price fetching.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    /// Minimum gap between two requests from the same worker.
    pub per_worker_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            per_worker_interval_ms: 1000,
            request_timeout_secs: 20,
        }
    }
}

/// Enrichment pool sizing and the bottom-rebound rule.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub concurrency: usize,
    pub history_days: i64,
    /// Split the universe across configured accounts, one pool each.
    pub shard_by_account: bool,
    pub blacklist_path: Option<String>,
    pub only_bottom_rebound: bool,
    pub min_rebound: f64,
    pub max_rebound: f64,
    pub max_rebound_1d: f64,
    pub min_rebound_abs: f64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            history_days: 7,
            shard_by_account: false,
            blacklist_path: None,
            only_bottom_rebound: false,
            min_rebound: 0.50,
            max_rebound: 0.80,
            max_rebound_1d: 0.05,
            min_rebound_abs: 0.03,
        }
    }
}

/// Forecast batching for the coarse and precise passes.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictionConfig {
    pub enabled: bool,
    pub horizon_days: u32,
    /// Minimum forecast upside for the coarse filter to keep an item.
    pub min_upside: f64,
    pub coarse_batch_size: usize,
    pub coarse_concurrency: usize,
    pub precise_batch_size: usize,
    pub precise_concurrency: usize,
    pub inter_batch_delay_ms: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            horizon_days: 7,
            min_upside: 0.03,
            coarse_batch_size: 10,
            coarse_concurrency: 20,
            precise_batch_size: 10,
            precise_concurrency: 20,
            inter_batch_delay_ms: 100,
        }
    }
}

/// Budget and plan construction.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AllocationConfig {
    pub budget: f64,
    pub max_quantity_per_item: u32,
    pub max_distinct_items: usize,
    /// Stop adding items once the remaining budget is at or below this.
    pub min_remaining_budget: f64,
    pub per_round_bucket_cap: usize,
    pub max_rounds: usize,
    /// Secondary thresholds for a second unit.
    pub double_unit_min_profit_rate: f64,
    pub double_unit_min_days: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            budget: 2000.0,
            max_quantity_per_item: 2,
            max_distinct_items: 100,
            min_remaining_budget: 10.0,
            per_round_bucket_cap: 5,
            max_rounds: 20,
            double_unit_min_profit_rate: 0.18,
            double_unit_min_days: 5,
        }
    }
}

/// Last-look verification before commit.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VerificationConfig {
    pub workers: usize,
    pub interval_ms: u64,
    pub auto_commit: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            interval_ms: 2000,
            auto_commit: false,
        }
    }
}

/// Held-inventory sweep.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PositionConfig {
    pub enabled: bool,
    pub workers: usize,
    pub interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub max_hold_days: i64,
    /// Fraction of the target that triggers the first partial sale.
    pub partial_trigger: f64,
    pub first_sell_fraction: f64,
    pub second_sell_fraction: f64,
    /// Open a `holding` position for every committed bid.
    pub open_on_commit: bool,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            interval_ms: 250,
            sweep_interval_secs: 600,
            max_hold_days: 10,
            partial_trigger: 0.8,
            first_sell_fraction: 0.5,
            second_sell_fraction: 0.3,
            open_on_commit: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://arbiter.db".to_string(),
        }
    }
}

/// Base URLs of the external collaborators.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    pub gateway_url: String,
    pub forecast_url: String,
    pub forecast_timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8600".to_string(),
            forecast_url: "http://127.0.0.1:5000".to_string(),
            forecast_timeout_secs: 60,
        }
    }
}

/// A marketplace identity; the token is read from `token_env`.
#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub token_env: String,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no stage can run with.
    pub fn validate(&self) -> Result<(), ArbError> {
        let f = &self.filters;
        if !(0.0..1.0).contains(&f.fee_rate) {
            return Err(ArbError::Config(format!("fee_rate must be in [0, 1), got {}", f.fee_rate)));
        }
        if f.min_price > f.max_reasonable_price {
            return Err(ArbError::Config("min_price exceeds max_reasonable_price".into()));
        }
        if self.allocation.budget <= 0.0 {
            return Err(ArbError::Config("budget must be positive".into()));
        }
        if self.allocation.max_quantity_per_item == 0 {
            return Err(ArbError::Config("max_quantity_per_item must be at least 1".into()));
        }
        let workers = [
            ("enrichment.concurrency", self.enrichment.concurrency),
            ("prediction.coarse_concurrency", self.prediction.coarse_concurrency),
            ("prediction.precise_concurrency", self.prediction.precise_concurrency),
            ("verification.workers", self.verification.workers),
            ("positions.workers", self.positions.workers),
        ];
        if let Some((name, _)) = workers.iter().find(|(_, n)| *n == 0) {
            return Err(ArbError::Config(format!("{name} must be at least 1")));
        }
        if self.positions.max_hold_days < 0 {
            return Err(ArbError::Config("positions.max_hold_days cannot be negative".into()));
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
