//! Composite opportunity score.
//!
//! `ScoringEngine::score` is pure: no I/O, no interior state, so pools can
//! call it concurrently and re-sorts can call it again without caching.
//! Every term is additive except the popular-but-worn penalty, which scales
//! the running total after the category and wear terms.

use std::fmt;

use super::signals::{is_popular, wear_tier};
use crate::types::{Opportunity, RiskLevel, Trend};

/// Multiplier when a popular family comes in poor condition.
const WORN_POPULAR_PENALTY: f64 = 0.85;

/// Where the current buy price sits against its trailing average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    /// At least 5% below average.
    DeepDiscount,
    /// 2% to 5% below average.
    Discount,
    /// Near average and rising.
    EarlyRise,
    /// Up to 5% above average and rising.
    Rising,
    /// 5% to 10% above average.
    Premium,
    /// More than 10% above average.
    Overheated,
    Neutral,
    /// No trailing average to compare against.
    NoHistory,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::DeepDiscount => "deep_discount",
            CycleStage::Discount => "discount",
            CycleStage::EarlyRise => "early_rise",
            CycleStage::Rising => "rising",
            CycleStage::Premium => "premium",
            CycleStage::Overheated => "overheated",
            CycleStage::Neutral => "neutral",
            CycleStage::NoHistory => "no_history",
        }
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-term contributions, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreBreakdown {
    pub popularity: f64,
    pub wear: f64,
    pub worn_penalty_applied: bool,
    pub profit: f64,
    pub risk: f64,
    pub bid_ask: f64,
    pub depth: f64,
    pub trend: f64,
    pub days: f64,
    pub absolute_profit: f64,
    pub rank: f64,
    pub cycle: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    popular_keywords: Vec<String>,
}

impl ScoringEngine {
    pub fn new(popular_keywords: Vec<String>) -> Self {
        Self { popular_keywords }
    }

    /// Final score, rounded to one decimal and floored at zero.
    pub fn score(&self, opp: &Opportunity) -> f64 {
        self.breakdown(opp).total
    }

    pub fn breakdown(&self, opp: &Opportunity) -> ScoreBreakdown {
        let popular = is_popular(&opp.name, &self.popular_keywords);
        let wear = wear_tier(&opp.name);

        let mut b = ScoreBreakdown {
            popularity: if popular { 7.0 } else { 2.0 },
            wear: wear * 2.5,
            ..Default::default()
        };

        let mut running = b.popularity + b.wear;
        if popular && wear <= 2.0 {
            running *= WORN_POPULAR_PENALTY;
            b.worn_penalty_applied = true;
        }

        b.profit = profit_term(opp.profit_rate);
        b.risk = match opp.risk {
            RiskLevel::Low => 15.0,
            RiskLevel::Medium => 9.0,
            RiskLevel::High => 1.5,
        };
        b.bid_ask = bid_ask_term(opp.buy_order_count, opp.sell_order_count);
        b.depth = depth_term(opp.buy_order_count + opp.sell_order_count);
        b.trend = match opp.trend {
            Trend::Up => 7.0,
            Trend::Stable => 5.0,
            Trend::Down => 1.0,
            Trend::Unknown => 3.5,
        };
        b.days = days_term(opp.days_of_data);
        b.absolute_profit = absolute_profit_term(opp.estimated_profit);
        b.rank = rank_term(opp.rank);
        b.cycle = cycle_term(cycle_stage(opp), opp.trend);

        running += b.profit
            + b.risk
            + b.bid_ask
            + b.depth
            + b.trend
            + b.days
            + b.absolute_profit
            + b.rank
            + b.cycle;

        b.total = ((running * 10.0).round() / 10.0).max(0.0);
        b
    }
}

fn profit_term(rate: f64) -> f64 {
    match rate {
        r if r >= 0.20 => 25.0,
        r if r >= 0.15 => 22.0,
        r if r >= 0.10 => 19.0,
        r if r >= 0.08 => 16.0,
        r => r * 180.0,
    }
}

fn bid_ask_term(buy_count: u32, sell_count: u32) -> f64 {
    let ratio = f64::from(buy_count) / (f64::from(sell_count) + 1.0);
    match ratio {
        r if r > 0.8 => 9.0,
        r if r > 0.5 => 6.5,
        r if r > 0.3 => 4.5,
        r => r * 12.0,
    }
}

fn depth_term(total: u32) -> f64 {
    match total {
        t if t >= 400 => 7.0,
        t if t >= 250 => 5.5,
        t if t >= 150 => 3.5,
        t => f64::from(t) * 0.02,
    }
}

fn days_term(days: u32) -> f64 {
    match days {
        d if d >= 7 => 5.0,
        d if d >= 5 => 4.0,
        d if d >= 3 => 2.5,
        d => f64::from(d) * 0.7,
    }
}

fn absolute_profit_term(profit: f64) -> f64 {
    match profit {
        p if p >= 50.0 => 3.0,
        p if p >= 20.0 => 2.0,
        p if p >= 10.0 => 1.0,
        _ => 0.0,
    }
}

fn rank_term(rank: Option<u32>) -> f64 {
    match rank {
        None => 2.5,
        Some(r) if r <= 500 => 5.0,
        Some(r) if r <= 800 => 4.5,
        Some(r) if r <= 1000 => 4.0,
        Some(r) if r <= 3000 => 3.5,
        Some(r) if r <= 5000 => 3.0,
        Some(r) if r <= 10000 => 2.5,
        Some(_) => 0.5,
    }
}

/// Classify the buy price against the mean of the 7-day buy and sell averages.
pub fn cycle_stage(opp: &Opportunity) -> CycleStage {
    let avg = (opp.avg_buy_price_7d + opp.avg_sell_price_7d) / 2.0;
    if avg <= 0.0 {
        return CycleStage::NoHistory;
    }
    let deviation = (opp.current_buy_price - avg) / avg;
    let rising = opp.trend == Trend::Up;

    if deviation <= -0.05 {
        CycleStage::DeepDiscount
    } else if deviation <= -0.02 {
        CycleStage::Discount
    } else if deviation <= 0.02 && rising {
        CycleStage::EarlyRise
    } else if deviation <= 0.05 && rising {
        CycleStage::Rising
    } else if deviation > 0.10 {
        CycleStage::Overheated
    } else if deviation > 0.05 {
        CycleStage::Premium
    } else {
        CycleStage::Neutral
    }
}

fn cycle_term(stage: CycleStage, trend: Trend) -> f64 {
    match stage {
        CycleStage::DeepDiscount if trend == Trend::Up => 11.0,
        CycleStage::DeepDiscount => 12.0,
        CycleStage::Discount => 9.5,
        CycleStage::EarlyRise => 8.0,
        CycleStage::Rising => 5.0,
        CycleStage::Premium => 2.0,
        CycleStage::Overheated => 0.5,
        CycleStage::Neutral | CycleStage::NoHistory => 6.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_opportunity(name: &str) -> Opportunity {
        Opportunity {
            id: 1,
            name: name.to_string(),
            current_buy_price: 100.0,
            current_sell_price: 115.0,
            avg_buy_price_7d: 100.0,
            avg_sell_price_7d: 100.0,
            profit_rate: 0.1385,
            estimated_profit: 13.85,
            trend: Trend::Stable,
            risk: RiskLevel::Medium,
            buy_order_count: 40,
            sell_order_count: 120,
            days_of_data: 7,
            rank: Some(600),
            score: 0.0,
            recommended_buy_price: 101.0,
            recommended_quantity: 1,
            analysed_at: Utc::now(),
        }
    }

    fn make_engine() -> ScoringEngine {
        ScoringEngine::new(vec!["AK-47".to_string(), "AWP".to_string()])
    }

    #[test]
    fn test_score_is_deterministic() {
        let engine = make_engine();
        let opp = make_opportunity("AK-47 | Redline (Field-Tested)");
        assert_eq!(engine.score(&opp), engine.score(&opp));
    }

    #[test]
    fn test_known_breakdown() {
        let engine = make_engine();
        let b = engine.breakdown(&make_opportunity("AK-47 | Redline (Field-Tested)"));
        assert_eq!(b.popularity, 7.0);
        assert_eq!(b.wear, 7.5);
        assert!(!b.worn_penalty_applied);
        assert_eq!(b.profit, 19.0);
        assert_eq!(b.risk, 9.0);
        // 40 / 121 ≈ 0.33
        assert_eq!(b.bid_ask, 4.5);
        assert_eq!(b.depth, 3.5);
        assert_eq!(b.trend, 5.0);
        assert_eq!(b.days, 5.0);
        assert_eq!(b.absolute_profit, 1.0);
        assert_eq!(b.rank, 4.5);
        assert_eq!(b.cycle, 6.0);
        assert_eq!(b.total, 72.0);
    }

    #[test]
    fn test_worn_popular_penalty() {
        let engine = make_engine();
        let b = engine.breakdown(&make_opportunity("AWP | Asiimov (Battle-Scarred)"));
        assert!(b.worn_penalty_applied);
        let plain = engine.breakdown(&make_opportunity("MP9 | Hydra (Battle-Scarred)"));
        assert!(!plain.worn_penalty_applied);
    }

    #[test]
    fn test_profit_term_extrapolates_below_bands() {
        assert_eq!(profit_term(0.25), 25.0);
        assert_eq!(profit_term(0.08), 16.0);
        assert!((profit_term(0.05) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_cycle_stages() {
        let mut opp = make_opportunity("x");
        opp.current_buy_price = 90.0;
        assert_eq!(cycle_stage(&opp), CycleStage::DeepDiscount);
        assert_eq!(cycle_term(CycleStage::DeepDiscount, Trend::Down), 12.0);
        assert_eq!(cycle_term(CycleStage::DeepDiscount, Trend::Up), 11.0);
        opp.current_buy_price = 97.0;
        assert_eq!(cycle_stage(&opp), CycleStage::Discount);
        opp.current_buy_price = 101.0;
        assert_eq!(cycle_stage(&opp), CycleStage::Neutral);
        opp.trend = Trend::Up;
        assert_eq!(cycle_stage(&opp), CycleStage::EarlyRise);
        opp.current_buy_price = 104.0;
        assert_eq!(cycle_stage(&opp), CycleStage::Rising);
        opp.current_buy_price = 108.0;
        assert_eq!(cycle_stage(&opp), CycleStage::Premium);
        opp.current_buy_price = 115.0;
        assert_eq!(cycle_stage(&opp), CycleStage::Overheated);
        opp.avg_buy_price_7d = 0.0;
        opp.avg_sell_price_7d = 0.0;
        assert_eq!(cycle_stage(&opp), CycleStage::NoHistory);
    }

    #[test]
    fn test_score_never_negative() {
        let engine = make_engine();
        let mut opp = make_opportunity("x");
        opp.profit_rate = -2.0;
        assert_eq!(engine.score(&opp), 0.0);
    }
}
