//! Strategy layer: trend and risk signals, scoring, and allocation.
//!
//! `OpportunityBuilder` is the analysis stage. It turns enriched
//! candidates (plus optional forecasts) into scored `Opportunity` values
//! and keeps a decision log of what was dropped and why.

pub mod allocator;
pub mod scoring;
pub mod signals;

use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::config::FilterConfig;
use crate::types::{EnrichedCandidate, Forecast, ItemId, Opportunity, Trend};
use scoring::ScoringEngine;
use signals::{classify_risk, is_popular, is_stattrak, regression_trend, trend_from_forecast, wear_tier, RiskInputs};

/// Bid placed slightly above the current best purchase order.
const RECOMMENDED_BUY_MARKUP: f64 = 1.01;

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Net sell no longer exceeds buy.
    NoSpread,
    BelowMinProfit,
    /// The forecast at the horizon sits below today's buy price.
    ForecastBelowBuy,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NoSpread => "no spread",
            SkipReason::BelowMinProfit => "below min profit",
            SkipReason::ForecastBelowBuy => "forecast below buy",
        };
        f.write_str(s)
    }
}

/// What happened to each candidate during analysis.
#[derive(Debug, Clone)]
pub enum DecisionRecord {
    Built { id: ItemId, score: f64 },
    Skipped { id: ItemId, reason: SkipReason },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OpportunityBuilder {
    filters: FilterConfig,
    horizon_days: u32,
    scorer: ScoringEngine,
}

impl OpportunityBuilder {
    pub fn new(filters: FilterConfig, horizon_days: u32) -> Self {
        let scorer = ScoringEngine::new(filters.popular_keywords.clone());
        Self {
            filters,
            horizon_days,
            scorer,
        }
    }

    /// Classify and score one candidate.
    ///
    /// Profit is recomputed from the candidate's current price pair, so a
    /// candidate re-priced since enrichment is judged on its new numbers.
    pub fn build(
        &self,
        candidate: &EnrichedCandidate,
        forecast: Option<&Forecast>,
    ) -> Result<Opportunity, SkipReason> {
        let econ = candidate.economics(self.filters.fee_rate);
        if econ.profit <= 0.0 {
            return Err(SkipReason::NoSpread);
        }
        if econ.profit_rate < self.filters.min_profit_rate {
            return Err(SkipReason::BelowMinProfit);
        }

        let predicted = forecast.and_then(|f| f.price_at_day(self.horizon_days));
        if let Some(p) = predicted {
            if p > 0.0 && p < candidate.buy_price {
                return Err(SkipReason::ForecastBelowBuy);
            }
        }

        let trend = forecast
            .and_then(|f| trend_from_forecast(f, candidate.buy_price, self.horizon_days))
            .unwrap_or_else(|| {
                if candidate.has_enough_history {
                    regression_trend(&candidate.sell_history)
                } else {
                    Trend::Unknown
                }
            });

        let name = &candidate.item.name;
        let risk = classify_risk(&RiskInputs {
            sell_history: &candidate.sell_history,
            has_enough_history: candidate.has_enough_history,
            buy_count: candidate.buy_count,
            sell_count: candidate.sell_count,
            profit_rate: econ.profit_rate,
            popular: is_popular(name, &self.filters.popular_keywords),
            wear: wear_tier(name),
            stattrak: is_stattrak(name),
        });

        let mut opp = Opportunity {
            id: candidate.item.id,
            name: name.clone(),
            current_buy_price: candidate.buy_price,
            current_sell_price: candidate.sell_price,
            avg_buy_price_7d: candidate.avg_buy_7d,
            avg_sell_price_7d: candidate.avg_sell_7d,
            profit_rate: econ.profit_rate,
            estimated_profit: econ.profit,
            trend,
            risk,
            buy_order_count: candidate.buy_count,
            sell_order_count: candidate.sell_count,
            days_of_data: candidate.days_of_data,
            rank: candidate.rank,
            score: 0.0,
            recommended_buy_price: candidate.buy_price * RECOMMENDED_BUY_MARKUP,
            recommended_quantity: 1,
            analysed_at: Utc::now(),
        };
        opp.score = self.scorer.score(&opp);
        Ok(opp)
    }

    /// Build every candidate, best score first.
    pub fn build_all(
        &self,
        candidates: &[EnrichedCandidate],
        forecasts: &HashMap<ItemId, Forecast>,
    ) -> (Vec<Opportunity>, Vec<DecisionRecord>) {
        let mut opportunities = Vec::with_capacity(candidates.len());
        let mut decisions = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let id = candidate.item.id;
            match self.build(candidate, forecasts.get(&id)) {
                Ok(opp) => {
                    decisions.push(DecisionRecord::Built { id, score: opp.score });
                    opportunities.push(opp);
                }
                Err(reason) => {
                    debug!(item_id = id, reason = %reason, "Candidate dropped in analysis");
                    decisions.push(DecisionRecord::Skipped { id, reason });
                }
            }
        }

        opportunities.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        info!(
            candidates = candidates.len(),
            opportunities = opportunities.len(),
            "Analysis complete"
        );
        (opportunities, decisions)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Item, RiskLevel};

    fn make_candidate(id: ItemId, buy: f64, sell: f64) -> EnrichedCandidate {
        EnrichedCandidate {
            item: Item::new(id, format!("AK-47 | Slate (Minimal Wear) #{id}")),
            buy_price: buy,
            sell_price: sell,
            buy_count: 30,
            sell_count: 200,
            avg_buy_7d: buy,
            avg_sell_7d: sell,
            days_of_data: 7,
            has_enough_history: true,
            rank: Some(400),
            sell_history: vec![sell; 7],
            live_quote: true,
            rebound: None,
        }
    }

    fn make_forecast(id: ItemId, day7: f64) -> Forecast {
        Forecast {
            item_id: id,
            current_price: day7,
            path: vec![day7; 7],
            confidence: 0.9,
        }
    }

    fn make_builder() -> OpportunityBuilder {
        OpportunityBuilder::new(FilterConfig::default(), 7)
    }

    #[test]
    fn test_example_candidate_survives() {
        let builder = make_builder();
        let opp = builder.build(&make_candidate(1, 10.0, 12.0), None).unwrap();
        assert!((opp.estimated_profit - 1.88).abs() < 1e-9);
        assert!((opp.profit_rate - 0.188).abs() < 1e-9);
        assert!((opp.recommended_buy_price - 10.1).abs() < 1e-9);
        assert_eq!(opp.trend, Trend::Stable);
        assert_eq!(opp.risk, RiskLevel::Low);
        assert!(opp.score > 0.0);
    }

    #[test]
    fn test_forecast_below_buy_is_dropped() {
        let builder = make_builder();
        let forecast = make_forecast(1, 9.5);
        assert_eq!(
            builder.build(&make_candidate(1, 10.0, 12.0), Some(&forecast)),
            Err(SkipReason::ForecastBelowBuy)
        );
    }

    #[test]
    fn test_forecast_drives_trend() {
        let builder = make_builder();
        let forecast = make_forecast(1, 11.0);
        let opp = builder
            .build(&make_candidate(1, 10.0, 12.0), Some(&forecast))
            .unwrap();
        assert_eq!(opp.trend, Trend::Up);
    }

    #[test]
    fn test_thin_margin_skipped() {
        let builder = make_builder();
        assert_eq!(
            builder.build(&make_candidate(1, 10.0, 10.5), None),
            Err(SkipReason::BelowMinProfit)
        );
        assert_eq!(
            builder.build(&make_candidate(1, 10.0, 10.0), None),
            Err(SkipReason::NoSpread)
        );
    }

    #[test]
    fn test_build_all_sorts_and_logs() {
        let builder = make_builder();
        let candidates = vec![
            make_candidate(1, 10.0, 11.5),
            make_candidate(2, 10.0, 13.0),
            make_candidate(3, 10.0, 10.0),
        ];
        let (opps, decisions) = builder.build_all(&candidates, &HashMap::new());
        assert_eq!(opps.len(), 2);
        assert!(opps[0].score >= opps[1].score);
        assert_eq!(decisions.len(), 3);
        assert!(decisions
            .iter()
            .any(|d| matches!(d, DecisionRecord::Skipped { id: 3, .. })));
    }
}
