//! Batched forecast retrieval.
//!
//! IDs are split into fixed-size batches and pulled by a bounded pool;
//! each worker calls the forecast source once per batch and sleeps the
//! inter-batch delay between its own calls. A failed batch leaves its IDs
//! out of the map and counts them as errors. Counts are per ID, so
//! `success_count + error_count` equals the number of IDs processed.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{run_pool, Worker};
use crate::sources::ForecastSource;
use crate::types::{Forecast, ItemId};

#[derive(Debug, Default)]
pub struct PredictionOutcome {
    pub forecasts: HashMap<ItemId, Forecast>,
    pub success_count: usize,
    pub error_count: usize,
    pub failed_batches: usize,
    pub cancelled: bool,
}

struct BatchResult {
    ids: Vec<ItemId>,
    result: Result<HashMap<ItemId, Forecast>, String>,
}

struct PredictionWorker {
    source: Arc<dyn ForecastSource>,
    delay: Duration,
    horizon_days: u32,
    called: bool,
}

#[async_trait]
impl Worker for PredictionWorker {
    type Task = Vec<ItemId>;
    type Output = BatchResult;

    async fn process(&mut self, ids: Vec<ItemId>) -> BatchResult {
        if self.called && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.called = true;
        let result = self
            .source
            .batch_forecast(&ids, self.horizon_days)
            .await
            .map_err(|e| format!("{e:#}"));
        BatchResult { ids, result }
    }
}

pub struct PredictionBatcher {
    source: Arc<dyn ForecastSource>,
    inter_batch_delay: Duration,
}

impl PredictionBatcher {
    pub fn new(source: Arc<dyn ForecastSource>, inter_batch_delay: Duration) -> Self {
        Self {
            source,
            inter_batch_delay,
        }
    }

    /// Forecast every ID in `ids`. Batch size and concurrency are clamped to at least 1.
    pub async fn predict(
        &self,
        label: &'static str,
        ids: &[ItemId],
        batch_size: usize,
        concurrency: usize,
        horizon_days: u32,
        cancel: &CancellationToken,
    ) -> PredictionOutcome {
        let mut seen = HashSet::new();
        let unique: Vec<ItemId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.is_empty() {
            return PredictionOutcome::default();
        }

        let batches: Vec<Vec<ItemId>> = unique.chunks(batch_size.max(1)).map(<[ItemId]>::to_vec).collect();
        let workers: Vec<PredictionWorker> = (0..concurrency.max(1).min(batches.len()))
            .map(|_| PredictionWorker {
                source: Arc::clone(&self.source),
                delay: self.inter_batch_delay,
                horizon_days,
                called: false,
            })
            .collect();

        info!(
            stage = label,
            ids = unique.len(),
            batches = batches.len(),
            workers = workers.len(),
            "Starting forecast batches"
        );
        let run = run_pool(label, workers, batches, cancel).await;

        let mut outcome = PredictionOutcome {
            cancelled: run.cancelled,
            ..Default::default()
        };
        let mut processed = 0;
        for batch in run.results {
            processed += batch.ids.len();
            match batch.result {
                Ok(mut map) => {
                    for id in &batch.ids {
                        if let Some(f) = map.remove(id) {
                            outcome.forecasts.insert(*id, f);
                        }
                    }
                    if !map.is_empty() {
                        debug!(stage = label, extra = map.len(), "Ignoring forecasts outside the batch");
                    }
                }
                Err(e) => {
                    warn!(stage = label, size = batch.ids.len(), error = %e, "Forecast batch failed");
                    outcome.failed_batches += 1;
                }
            }
        }
        outcome.success_count = outcome.forecasts.len();
        outcome.error_count = processed - outcome.success_count;

        info!(
            stage = label,
            success = outcome.success_count,
            errors = outcome.error_count,
            failed_batches = outcome.failed_batches,
            "Forecast batches complete"
        );
        outcome
    }
}

/// Keep IDs whose forecast at `horizon_days` clears `current × (1 + min_upside)`.
/// IDs without a forecast, or with one that cannot be judged, are kept.
pub fn retain_upside(
    ids: &[ItemId],
    forecasts: &HashMap<ItemId, Forecast>,
    horizon_days: u32,
    min_upside: f64,
) -> Vec<ItemId> {
    let mut missing = 0usize;
    let mut unusable = 0usize;
    let kept: Vec<ItemId> = ids
        .iter()
        .copied()
        .filter(|id| match forecasts.get(id) {
            None => {
                missing += 1;
                true
            }
            Some(f) => match f.price_at_day(horizon_days) {
                Some(p) if f.current_price > 0.0 => p >= f.current_price * (1.0 + min_upside),
                _ => {
                    unusable += 1;
                    true
                }
            },
        })
        .collect();
    debug!(
        kept = kept.len(),
        rejected = ids.len() - kept.len(),
        missing,
        unusable,
        "Coarse upside filter applied"
    );
    kept
}
