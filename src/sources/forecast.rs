//! Forecast service client.
//!
//! The forecast service runs an ensemble of time-series models and exposes
//! a batch endpoint:
//!
//! `POST {base}/api/batch-predict` with `{ "good_ids": [..], "days": n }`
//!
//! Each result carries the current price, an ensemble forecast path and a
//! recommendation block with a confidence value. Results without a usable
//! ensemble path are dropped, which surfaces as a missing key to callers.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::ForecastSource;
use crate::types::{ArbError, Forecast, ItemId};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The service rejects batches outside 1..=100 items.
pub const MAX_BATCH_SIZE: usize = 100;

/// Confidence assumed when the service omits one.
const DEFAULT_CONFIDENCE: f64 = 0.95;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    good_ids: &'a [ItemId],
    days: u32,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    total_requested: usize,
    #[serde(default)]
    total_success: usize,
    #[serde(default)]
    results: Vec<PredictionResult>,
}

#[derive(Debug, Deserialize)]
struct PredictionResult {
    good_id: ItemId,
    #[serde(default)]
    current_price: f64,
    #[serde(default)]
    ensemble: Option<EnsembleBlock>,
    #[serde(default)]
    recommendation: Option<RecommendationBlock>,
}

#[derive(Debug, Deserialize)]
struct EnsembleBlock {
    #[serde(default)]
    forecast: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct RecommendationBlock {
    #[serde(default)]
    confidence: Option<f64>,
}

impl PredictionResult {
    fn into_forecast(self) -> Option<Forecast> {
        let path = self.ensemble.map(|e| e.forecast).unwrap_or_default();
        if path.is_empty() {
            return None;
        }
        let confidence = self
            .recommendation
            .and_then(|r| r.confidence)
            .unwrap_or(DEFAULT_CONFIDENCE);
        Some(Forecast {
            item_id: self.good_id,
            current_price: self.current_price,
            path,
            confidence,
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpForecastClient {
    http: Client,
    base_url: String,
}

impl HttpForecastClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build forecast HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Liveness probe for start-up diagnostics.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Forecast service health check failed");
                false
            }
        }
    }
}

fn collect_results(resp: BatchResponse) -> HashMap<ItemId, Forecast> {
    if resp.total_success < resp.total_requested {
        debug!(
            requested = resp.total_requested,
            succeeded = resp.total_success,
            "Forecast batch partially succeeded"
        );
    }
    resp.results
        .into_iter()
        .filter_map(PredictionResult::into_forecast)
        .map(|f| (f.item_id, f))
        .collect()
}

#[async_trait]
impl ForecastSource for HttpForecastClient {
    async fn batch_forecast(
        &self,
        item_ids: &[ItemId],
        horizon_days: u32,
    ) -> Result<HashMap<ItemId, Forecast>> {
        if item_ids.is_empty() || item_ids.len() > MAX_BATCH_SIZE {
            bail!(ArbError::Forecast(format!(
                "batch must hold 1-{MAX_BATCH_SIZE} items, got {}",
                item_ids.len()
            )));
        }

        let url = format!("{}/api/batch-predict", self.base_url);
        let body = BatchRequest {
            good_ids: item_ids,
            days: horizon_days,
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Forecast batch request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "Forecast service returned an error");
            bail!(ArbError::Forecast(format!("batch failed (HTTP {status})")));
        }

        let parsed: BatchResponse = resp
            .json()
            .await
            .context("Failed to parse forecast batch response")?;

        Ok(collect_results(parsed))
    }
}
