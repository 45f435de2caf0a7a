//! Budget-constrained purchase planning.
//!
//! Candidates are first interleaved across price buckets so no single
//! tier floods the list, then the same interleaved list is walked under
//! four orderings. The plan with the highest estimated profit wins; the
//! earlier ordering wins a tie.

use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

use crate::config::AllocationConfig;
use crate::types::{
    Opportunity, PlanOrdering, PurchasePlan, PurchasePlanItem, RiskLevel, SpreadEconomics, Trend,
};

// ---------------------------------------------------------------------------
// Price buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceBucket {
    Under10,
    From10To50,
    From50To100,
    From100To300,
    From300To500,
    Over500,
}

impl PriceBucket {
    /// Round-robin visiting order.
    pub const INTERLEAVE_ORDER: [PriceBucket; 6] = [
        PriceBucket::From100To300,
        PriceBucket::From300To500,
        PriceBucket::Over500,
        PriceBucket::From50To100,
        PriceBucket::From10To50,
        PriceBucket::Under10,
    ];

    pub fn of(price: f64) -> Self {
        match price {
            p if p < 10.0 => PriceBucket::Under10,
            p if p < 50.0 => PriceBucket::From10To50,
            p if p < 100.0 => PriceBucket::From50To100,
            p if p < 300.0 => PriceBucket::From100To300,
            p if p < 500.0 => PriceBucket::From300To500,
            _ => PriceBucket::Over500,
        }
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Result of trying every ordering.
#[derive(Debug, Clone)]
pub struct PlanSelection {
    pub best: PurchasePlan,
    /// One plan per ordering, in evaluation order.
    pub candidates: Vec<PurchasePlan>,
}

pub struct PortfolioAllocator {
    config: AllocationConfig,
    fee_rate: f64,
}

impl PortfolioAllocator {
    pub fn new(config: AllocationConfig, fee_rate: f64) -> Self {
        Self { config, fee_rate }
    }

    pub fn budget(&self) -> f64 {
        self.config.budget
    }

    /// Units to buy of `opp` given what is left of the budget.
    ///
    /// Falling or high-risk items always get exactly one unit. Otherwise a
    /// second unit needs a strong margin, low risk, a non-falling trend and
    /// enough history; the result never exceeds the per-item maximum.
    pub fn calculate_optimal_quantity(&self, opp: &Opportunity, remaining_budget: f64) -> u32 {
        if opp.trend == Trend::Down || opp.risk == RiskLevel::High {
            return 1;
        }
        let unit = unit_price(opp);
        if unit <= 0.0 || unit > remaining_budget {
            return 0;
        }

        let mut quantity = 1;
        let qualifies = opp.profit_rate >= self.config.double_unit_min_profit_rate
            && opp.risk == RiskLevel::Low
            && matches!(opp.trend, Trend::Up | Trend::Stable)
            && opp.days_of_data >= self.config.double_unit_min_days
            && unit * 2.0 <= remaining_budget;
        if qualifies {
            quantity = 2;
        }

        let affordable = (remaining_budget / unit).floor() as u32;
        quantity.min(self.config.max_quantity_per_item).min(affordable.max(1))
    }

    /// Interleave candidates across price buckets.
    ///
    /// Each bucket is sorted by score then profit rate; every round takes up
    /// to the per-round cap from each bucket in `INTERLEAVE_ORDER`.
    pub fn rebalance_by_price(&self, opps: &[Opportunity]) -> Vec<Opportunity> {
        let mut buckets: Vec<Vec<&Opportunity>> = PriceBucket::INTERLEAVE_ORDER
            .iter()
            .map(|bucket| {
                let mut members: Vec<&Opportunity> = opps
                    .iter()
                    .filter(|o| PriceBucket::of(o.current_buy_price) == *bucket)
                    .collect();
                members.sort_by(|a, b| {
                    desc(a.score, b.score).then_with(|| desc(a.profit_rate, b.profit_rate))
                });
                members
            })
            .collect();

        let cap = self.config.per_round_bucket_cap.max(1);
        let mut out = Vec::with_capacity(opps.len());
        for _ in 0..self.config.max_rounds {
            let mut took_any = false;
            for bucket in buckets.iter_mut() {
                let take = cap.min(bucket.len());
                if take > 0 {
                    out.extend(bucket.drain(..take).cloned());
                    took_any = true;
                }
            }
            if !took_any {
                break;
            }
        }
        out
    }

    /// Walk `opps` in the given order, filling the budget greedily.
    pub fn allocate(&self, opps: &[Opportunity], budget: f64, ordering: PlanOrdering) -> PurchasePlan {
        let mut plan = PurchasePlan::empty(ordering, budget);
        let mut seen = HashSet::new();

        for opp in opps {
            let remaining = budget - plan.total_cost;
            if remaining <= self.config.min_remaining_budget
                || plan.items.len() >= self.config.max_distinct_items
            {
                break;
            }
            if !seen.insert(opp.id) {
                continue;
            }

            let quantity = self.calculate_optimal_quantity(opp, remaining);
            if quantity == 0 {
                continue;
            }
            let unit = unit_price(opp);
            let subtotal = unit * f64::from(quantity);
            if plan.total_cost + subtotal > budget {
                continue;
            }

            let per_unit = SpreadEconomics::compute(unit, opp.current_sell_price, self.fee_rate).profit;
            let expected_profit = per_unit * f64::from(quantity);

            plan.items.push(PurchasePlanItem {
                id: opp.id,
                name: opp.name.clone(),
                quantity,
                unit_price: unit,
                subtotal,
                expected_profit,
            });
            plan.total_cost += subtotal;
            plan.total_profit += expected_profit;
            plan.total_units += quantity;
        }

        if plan.total_cost > 0.0 {
            plan.profit_rate = plan.total_profit / plan.total_cost;
        }
        plan
    }

    /// Rebalance, try every ordering, keep the most profitable plan.
    pub fn best_plan(&self, opps: &[Opportunity]) -> PlanSelection {
        let budget = self.config.budget;
        let rebalanced = self.rebalance_by_price(opps);

        let candidates: Vec<PurchasePlan> = PlanOrdering::ALL
            .iter()
            .map(|ordering| {
                let ordered = order_candidates(&rebalanced, *ordering);
                let plan = self.allocate(&ordered, budget, *ordering);
                debug!(
                    ordering = %ordering,
                    items = plan.items.len(),
                    cost = format!("{:.2}", plan.total_cost),
                    profit = format!("{:.2}", plan.total_profit),
                    "Candidate plan"
                );
                plan
            })
            .collect();

        let mut best = 0;
        for (idx, plan) in candidates.iter().enumerate().skip(1) {
            if plan.total_profit > candidates[best].total_profit {
                best = idx;
            }
        }
        PlanSelection {
            best: candidates[best].clone(),
            candidates,
        }
    }
}

/// Order candidates for one allocation walk. `Score` keeps the
/// rebalanced order; the others sort descending and keep ties stable.
pub fn order_candidates(opps: &[Opportunity], ordering: PlanOrdering) -> Vec<Opportunity> {
    let mut ordered = opps.to_vec();
    match ordering {
        PlanOrdering::Score => {}
        PlanOrdering::ProfitRate => ordered.sort_by(|a, b| desc(a.profit_rate, b.profit_rate)),
        PlanOrdering::AbsoluteProfit => {
            ordered.sort_by(|a, b| desc(a.estimated_profit, b.estimated_profit))
        }
        PlanOrdering::Value => ordered.sort_by(|a, b| desc(a.value_index(), b.value_index())),
    }
    ordered
}

fn unit_price(opp: &Opportunity) -> f64 {
    if opp.recommended_buy_price > 0.0 {
        opp.recommended_buy_price
    } else {
        opp.current_buy_price
    }
}

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_opportunity(id: i64, cost: f64, profit: f64, score: f64) -> Opportunity {
        // Sell chosen so that sell * 0.99 - cost == profit.
        let sell = (cost + profit) / 0.99;
        Opportunity {
            id,
            name: format!("item {id}"),
            current_buy_price: cost,
            current_sell_price: sell,
            avg_buy_price_7d: cost,
            avg_sell_price_7d: sell,
            profit_rate: profit / cost,
            estimated_profit: profit,
            trend: Trend::Stable,
            risk: RiskLevel::Medium,
            buy_order_count: 20,
            sell_order_count: 200,
            days_of_data: 7,
            rank: None,
            score,
            recommended_buy_price: cost,
            recommended_quantity: 1,
            analysed_at: Utc::now(),
        }
    }

    fn make_allocator(budget: f64) -> PortfolioAllocator {
        PortfolioAllocator::new(
            AllocationConfig {
                budget,
                ..AllocationConfig::default()
            },
            0.01,
        )
    }

    #[test]
    fn test_down_or_high_risk_gets_one_unit() {
        let alloc = make_allocator(1000.0);
        let mut opp = make_opportunity(1, 10.0, 3.0, 50.0);
        opp.risk = RiskLevel::Low;
        opp.trend = Trend::Down;
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 1000.0), 1);
        opp.trend = Trend::Up;
        opp.risk = RiskLevel::High;
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 1000.0), 1);
    }

    #[test]
    fn test_second_unit_needs_every_threshold() {
        let alloc = make_allocator(1000.0);
        let mut opp = make_opportunity(1, 10.0, 2.0, 50.0);
        opp.risk = RiskLevel::Low;
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 1000.0), 2);

        opp.days_of_data = 4;
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 1000.0), 1);

        opp.days_of_data = 7;
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 15.0), 1);
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 5.0), 0);
    }

    #[test]
    fn test_quantity_capped_by_max() {
        let alloc = PortfolioAllocator::new(
            AllocationConfig {
                max_quantity_per_item: 1,
                ..AllocationConfig::default()
            },
            0.01,
        );
        let mut opp = make_opportunity(1, 10.0, 3.0, 50.0);
        opp.risk = RiskLevel::Low;
        assert_eq!(alloc.calculate_optimal_quantity(&opp, 1000.0), 1);
    }

    #[test]
    fn test_rebalance_interleaves_buckets() {
        let alloc = PortfolioAllocator::new(
            AllocationConfig {
                per_round_bucket_cap: 1,
                ..AllocationConfig::default()
            },
            0.01,
        );
        let opps = vec![
            make_opportunity(1, 5.0, 1.0, 10.0),
            make_opportunity(2, 6.0, 1.0, 90.0),
            make_opportunity(3, 150.0, 20.0, 40.0),
            make_opportunity(4, 20.0, 3.0, 70.0),
        ];
        let ids: Vec<i64> = alloc.rebalance_by_price(&opps).iter().map(|o| o.id).collect();
        // Round 1: 100-300, 10-50, 0-10 (best score); round 2: remaining 0-10.
        assert_eq!(ids, vec![3, 4, 2, 1]);
    }

    #[test]
    fn test_allocate_respects_budget_and_cap() {
        let alloc = PortfolioAllocator::new(
            AllocationConfig {
                budget: 100.0,
                max_distinct_items: 2,
                ..AllocationConfig::default()
            },
            0.01,
        );
        let opps: Vec<Opportunity> = (1..=5).map(|i| make_opportunity(i, 30.0, 3.0, 50.0)).collect();
        let plan = alloc.allocate(&opps, 100.0, PlanOrdering::Score);
        assert_eq!(plan.items.len(), 2);
        assert!(plan.total_cost <= 100.0);
        assert!((plan.total_profit - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_allocate_stops_at_min_remaining() {
        let alloc = make_allocator(100.0);
        let opps = vec![make_opportunity(1, 91.0, 9.0, 50.0), make_opportunity(2, 5.0, 1.0, 40.0)];
        let plan = alloc.allocate(&opps, 100.0, PlanOrdering::Score);
        assert_eq!(plan.items.len(), 1);
    }

    #[test]
    fn test_best_plan_maximises_profit() {
        let alloc = make_allocator(100.0);
        let opps = vec![
            make_opportunity(1, 50.0, 5.0, 90.0),
            make_opportunity(2, 80.0, 20.0, 60.0),
            make_opportunity(3, 120.0, 40.0, 50.0),
        ];
        let selection = alloc.best_plan(&opps);
        assert_eq!(selection.candidates.len(), 4);
        assert!((selection.candidates[0].total_profit - 5.0).abs() < 1e-6);
        assert_eq!(selection.best.ordering, PlanOrdering::ProfitRate);
        assert_eq!(selection.best.items.len(), 1);
        assert_eq!(selection.best.items[0].id, 2);
        assert!(selection.best.total_cost <= 100.0);
    }
}
