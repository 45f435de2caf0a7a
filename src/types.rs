//! Shared types for the ARBITER pipeline.
//!
//! These types form the data model passed between the fetch, enrichment,
//! strategy, verification and position stages. They carry no I/O and no
//! interior mutability, so every stage can hand them across worker
//! boundaries by value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marketplace identifier of a tradeable good.
pub type ItemId = i64;

// ---------------------------------------------------------------------------
// Catalog & history
// ---------------------------------------------------------------------------

/// A catalog entry: the minimum needed to evaluate an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
}

impl Item {
    pub fn new(id: ItemId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.name)
    }
}

/// One stored price-index observation for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub item_id: ItemId,
    pub buy_price: Option<f64>,
    pub sell_price: Option<f64>,
    pub buy_count: Option<u32>,
    pub sell_count: Option<u32>,
    /// Popularity rank on the price index (1 = most traded).
    pub rank: Option<u32>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Both sides carry a positive price.
    pub fn has_usable_prices(&self) -> bool {
        matches!(self.buy_price, Some(b) if b > 0.0) && matches!(self.sell_price, Some(s) if s > 0.0)
    }
}

/// An item under evaluation this pass, with its history newest-first.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item: Item,
    pub snapshots: Vec<Snapshot>,
}

impl Candidate {
    /// Build a candidate, normalising snapshot order to newest first.
    pub fn new(item: Item, mut snapshots: Vec<Snapshot>) -> Self {
        snapshots.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Self { item, snapshots }
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.first()
    }

    /// Sell prices in chronological order (oldest first), skipping gaps.
    pub fn sell_series(&self) -> Vec<f64> {
        self.snapshots
            .iter()
            .rev()
            .filter_map(|s| s.sell_price.filter(|p| *p > 0.0))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Quotes & spread economics
// ---------------------------------------------------------------------------

/// Live quote for one identifier. When `ok` is false every price field is
/// meaningless and callers must branch on `ok`, never on zero values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub buy_price: f64,
    pub sell_price: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub ok: bool,
    pub failure_reason: Option<String>,
}

impl PriceQuote {
    /// Combine the two resolved sides. Only a pair of positive prices is usable.
    pub fn resolved(buy_price: f64, buy_count: u32, sell_price: f64, sell_count: u32) -> Self {
        let ok = buy_price > 0.0 && sell_price > 0.0;
        Self {
            buy_price,
            sell_price,
            buy_count,
            sell_count,
            ok,
            failure_reason: if ok {
                None
            } else {
                Some("invalid realtime prices".to_string())
            },
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            buy_price: 0.0,
            sell_price: 0.0,
            buy_count: 0,
            sell_count: 0,
            ok: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Net proceeds and margin of buying at `buy` and reselling at `sell`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadEconomics {
    /// Sell price after the marketplace fee.
    pub net_sell: f64,
    /// Absolute profit per unit.
    pub profit: f64,
    /// Profit relative to the buy price.
    pub profit_rate: f64,
}

impl SpreadEconomics {
    pub fn compute(buy: f64, sell: f64, fee_rate: f64) -> Self {
        let net_sell = sell * (1.0 - fee_rate);
        let profit = net_sell - buy;
        let profit_rate = if buy > 0.0 { profit / buy } else { 0.0 };
        Self {
            net_sell,
            profit,
            profit_rate,
        }
    }
}

// ---------------------------------------------------------------------------
// Enriched candidate
// ---------------------------------------------------------------------------

/// History window a decline or rebound was measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookbackWindow {
    OneDay,
    TwoDays,
    ThreeDays,
    SevenDays,
    ThirtyDays,
}

/// A recent decline followed by a bounded recovery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReboundSignal {
    /// Negative change over the decline window.
    pub decline: f64,
    pub decline_window: LookbackWindow,
    /// Positive change over the rebound window.
    pub rebound: f64,
    pub rebound_window: LookbackWindow,
    /// Share of the decline recovered so far.
    pub recovery: f64,
}

/// A candidate that passed every enrichment filter.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedCandidate {
    pub item: Item,
    pub buy_price: f64,
    pub sell_price: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub avg_buy_7d: f64,
    pub avg_sell_7d: f64,
    /// Number of snapshots in the history window.
    pub days_of_data: u32,
    pub has_enough_history: bool,
    pub rank: Option<u32>,
    /// Sell prices oldest first.
    pub sell_history: Vec<f64>,
    /// False when prices came from the latest snapshot.
    pub live_quote: bool,
    pub rebound: Option<ReboundSignal>,
}

impl EnrichedCandidate {
    pub fn economics(&self, fee_rate: f64) -> SpreadEconomics {
        SpreadEconomics::compute(self.buy_price, self.sell_price, fee_rate)
    }
}

// ---------------------------------------------------------------------------
// Classifications
// ---------------------------------------------------------------------------

/// Price direction of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
    Unknown,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Down => "down",
            Trend::Stable => "stable",
            Trend::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trend {
    type Err = ArbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(Trend::Up),
            "down" => Ok(Trend::Down),
            "stable" => Ok(Trend::Stable),
            "unknown" => Ok(Trend::Unknown),
            other => Err(ArbError::Parse(format!("unknown trend: {other}"))),
        }
    }
}

/// Risk tier of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ArbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(ArbError::Parse(format!("unknown risk level: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// A scored, classified arbitrage candidate eligible for allocation.
///
/// Treated as immutable once built: a re-price produces a new value via
/// [`Opportunity::repriced`] so the profit fields always match the price pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: ItemId,
    pub name: String,
    pub current_buy_price: f64,
    pub current_sell_price: f64,
    pub avg_buy_price_7d: f64,
    pub avg_sell_price_7d: f64,
    pub profit_rate: f64,
    /// Absolute profit per unit after fees.
    pub estimated_profit: f64,
    pub trend: Trend,
    pub risk: RiskLevel,
    pub buy_order_count: u32,
    pub sell_order_count: u32,
    pub days_of_data: u32,
    pub rank: Option<u32>,
    pub score: f64,
    pub recommended_buy_price: f64,
    pub recommended_quantity: u32,
    pub analysed_at: DateTime<Utc>,
}

impl Opportunity {
    /// Copy with a new price pair; profit fields are recomputed from it.
    pub fn repriced(&self, buy: f64, sell: f64, fee_rate: f64) -> Self {
        let econ = SpreadEconomics::compute(buy, sell, fee_rate);
        Self {
            current_buy_price: buy,
            current_sell_price: sell,
            profit_rate: econ.profit_rate,
            estimated_profit: econ.profit,
            ..self.clone()
        }
    }

    /// Profit-rate × price composite used by the "value" ordering.
    pub fn value_index(&self) -> f64 {
        self.profit_rate * self.current_buy_price
    }
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} (buy {:.2} | sell {:.2} | {:.1}% | {} / {} | score {:.1})",
            self.id,
            self.name,
            self.current_buy_price,
            self.current_sell_price,
            self.profit_rate * 100.0,
            self.trend,
            self.risk,
            self.score,
        )
    }
}

// ---------------------------------------------------------------------------
// Purchase plan
// ---------------------------------------------------------------------------

/// Candidate ordering that produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrdering {
    Score,
    ProfitRate,
    AbsoluteProfit,
    Value,
}

impl PlanOrdering {
    /// Evaluation order; earlier entries win ties.
    pub const ALL: [PlanOrdering; 4] = [
        PlanOrdering::Score,
        PlanOrdering::ProfitRate,
        PlanOrdering::AbsoluteProfit,
        PlanOrdering::Value,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PlanOrdering::Score => "score_first",
            PlanOrdering::ProfitRate => "profit_rate_first",
            PlanOrdering::AbsoluteProfit => "absolute_profit_first",
            PlanOrdering::Value => "value_first",
        }
    }
}

impl fmt::Display for PlanOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PlanOrdering {
    type Err = ArbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanOrdering::ALL
            .into_iter()
            .find(|o| o.label() == s)
            .ok_or_else(|| ArbError::Parse(format!("unknown plan ordering: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasePlanItem {
    pub id: ItemId,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub subtotal: f64,
    pub expected_profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasePlan {
    pub ordering: PlanOrdering,
    pub items: Vec<PurchasePlanItem>,
    pub budget: f64,
    pub total_cost: f64,
    pub total_profit: f64,
    pub total_units: u32,
    pub profit_rate: f64,
    pub created_at: DateTime<Utc>,
}

impl PurchasePlan {
    pub fn empty(ordering: PlanOrdering, budget: f64) -> Self {
        Self {
            ordering,
            items: Vec::new(),
            budget,
            total_cost: 0.0,
            total_profit: 0.0,
            total_units: 0,
            profit_rate: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for PurchasePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} items / {} units, cost {:.2} of {:.2}, profit {:.2} ({:.1}%)",
            self.ordering,
            self.items.len(),
            self.total_units,
            self.total_cost,
            self.budget,
            self.total_profit,
            self.profit_rate * 100.0,
        )
    }
}

// ---------------------------------------------------------------------------
// Verification & orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Confirmation of a placed (or simulated) order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub item_id: ItemId,
    pub side: OrderSide,
    pub quantity: u32,
    pub price: f64,
    pub dry_run: bool,
    pub placed_at: DateTime<Utc>,
}

impl OrderReceipt {
    /// Synthetic receipt for a simulated order.
    pub fn dry_run(item_id: ItemId, side: OrderSide, quantity: u32, price: f64) -> Self {
        Self {
            order_id: format!("dry-{}", uuid::Uuid::new_v4()),
            item_id,
            side,
            quantity,
            price,
            dry_run: true,
            placed_at: Utc::now(),
        }
    }
}

/// Last-look outcome for one plan item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: ItemId,
    pub name: String,
    pub quantity: u32,
    pub original_buy: f64,
    pub original_sell: f64,
    pub verified_buy: f64,
    pub verified_sell: f64,
    pub verified_profit_rate: f64,
    pub profit_rate_delta: f64,
    pub still_valid: bool,
    /// Set when the item was invalidated.
    pub reason: Option<String>,
    /// True when the re-fetch failed and original numbers were kept.
    pub kept_on_fetch_failure: bool,
    pub order: Option<OrderReceipt>,
    /// Why no order was placed for a valid item, or why placement failed.
    pub order_note: Option<String>,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Holding,
    PartialSold,
    FullySold,
    StopLoss,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Holding => "holding",
            PositionStatus::PartialSold => "partial_sold",
            PositionStatus::FullySold => "fully_sold",
            PositionStatus::StopLoss => "stop_loss",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::FullySold | PositionStatus::StopLoss)
    }

    /// Statuses only move forward; terminal states accept nothing.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        match self {
            PositionStatus::Holding => true,
            PositionStatus::PartialSold => next != PositionStatus::Holding,
            PositionStatus::FullySold | PositionStatus::StopLoss => false,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = ArbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holding" => Ok(PositionStatus::Holding),
            "partial_sold" => Ok(PositionStatus::PartialSold),
            "fully_sold" => Ok(PositionStatus::FullySold),
            "stop_loss" => Ok(PositionStatus::StopLoss),
            other => Err(ArbError::Parse(format!("unknown position status: {other}"))),
        }
    }
}

/// Inventory bought through the pipeline and awaiting liquidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingPosition {
    /// Storage id; 0 until first saved.
    pub id: i64,
    pub item_id: ItemId,
    pub name: String,
    pub buy_price: f64,
    pub buy_quantity: u32,
    pub sold_quantity: u32,
    pub buy_time: DateTime<Utc>,
    pub current_price: f64,
    pub target_profit_rate: f64,
    pub max_loss_rate: f64,
    pub status: PositionStatus,
    pub realized_profit: f64,
    pub risk: RiskLevel,
    pub last_sold_price: Option<f64>,
    pub last_sold_at: Option<DateTime<Utc>>,
}

impl HoldingPosition {
    pub fn remaining(&self) -> u32 {
        self.buy_quantity.saturating_sub(self.sold_quantity)
    }

    /// Net margin of selling at `price` against the entry price.
    pub fn profit_rate_at(&self, price: f64, fee_rate: f64) -> f64 {
        SpreadEconomics::compute(self.buy_price, price, fee_rate).profit_rate
    }

    /// Whole days since purchase.
    pub fn days_held(&self, now: DateTime<Utc>) -> i64 {
        (now - self.buy_time).num_days()
    }

    /// Book a sale of up to `quantity` units and move to `next` status.
    ///
    /// The quantity is clamped to what remains, so `sold_quantity` never
    /// exceeds `buy_quantity`. Returns the number of units actually booked.
    pub fn record_sale(
        &mut self,
        quantity: u32,
        price: f64,
        fee_rate: f64,
        next: PositionStatus,
        now: DateTime<Utc>,
    ) -> Result<u32, ArbError> {
        if !self.status.can_transition_to(next) {
            return Err(ArbError::Position(format!(
                "position {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let units = quantity.min(self.remaining());
        let per_unit = SpreadEconomics::compute(self.buy_price, price, fee_rate).profit;
        self.sold_quantity += units;
        self.realized_profit += per_unit * f64::from(units);
        self.status = next;
        if units > 0 {
            self.last_sold_price = Some(price);
            self.last_sold_at = Some(now);
        }
        Ok(units)
    }
}

impl fmt::Display for HoldingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{}] {}/{} sold @ {:.2}, realized {:.2}",
            self.item_id,
            self.name,
            self.status,
            self.sold_quantity,
            self.buy_quantity,
            self.buy_price,
            self.realized_profit,
        )
    }
}

// ---------------------------------------------------------------------------
// Forecast
// ---------------------------------------------------------------------------

/// Multi-day price forecast for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub item_id: ItemId,
    pub current_price: f64,
    /// Daily predicted prices; `path[0]` is one day ahead.
    pub path: Vec<f64>,
    pub confidence: f64,
}

impl Forecast {
    /// Predicted price `day` days ahead (1-based).
    pub fn price_at_day(&self, day: u32) -> Option<f64> {
        let idx = usize::try_from(day).ok()?.checked_sub(1)?;
        self.path.get(idx).copied()
    }

    /// Relative change between the current price and `day` days ahead.
    pub fn change_at_day(&self, day: u32) -> Option<f64> {
        if self.current_price <= 0.0 {
            return None;
        }
        self.price_at_day(day)
            .map(|p| (p - self.current_price) / self.current_price)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Classified failure from the live price source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("item not found")]
    NotFound,
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ArbError {
    #[error("Forecast error: {0}")]
    Forecast(String),

    #[error("Order error (item {item_id}): {message}")]
    Order { item_id: ItemId, message: String },

    #[error("Position error: {0}")]
    Position(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_position(buy_quantity: u32) -> HoldingPosition {
        HoldingPosition {
            id: 1,
            item_id: 42,
            name: "AK-47 | Redline (Field-Tested)".to_string(),
            buy_price: 100.0,
            buy_quantity,
            sold_quantity: 0,
            buy_time: Utc::now() - Duration::days(2),
            current_price: 100.0,
            target_profit_rate: 0.08,
            max_loss_rate: -0.05,
            status: PositionStatus::Holding,
            realized_profit: 0.0,
            risk: RiskLevel::Medium,
            last_sold_price: None,
            last_sold_at: None,
        }
    }

    #[test]
    fn test_spread_economics_example() {
        let econ = SpreadEconomics::compute(10.0, 12.0, 0.01);
        assert!((econ.net_sell - 11.88).abs() < 1e-9);
        assert!((econ.profit - 1.88).abs() < 1e-9);
        assert!((econ.profit_rate - 0.188).abs() < 1e-9);
    }

    #[test]
    fn test_spread_economics_zero_buy() {
        let econ = SpreadEconomics::compute(0.0, 12.0, 0.01);
        assert_eq!(econ.profit_rate, 0.0);
    }

    #[test]
    fn test_quote_requires_both_sides_positive() {
        assert!(PriceQuote::resolved(10.0, 5, 12.0, 100).ok);
        let q = PriceQuote::resolved(10.0, 5, 0.0, 100);
        assert!(!q.ok);
        assert_eq!(q.failure_reason.as_deref(), Some("invalid realtime prices"));
        assert!(!PriceQuote::failed("timeout").ok);
    }

    #[test]
    fn test_candidate_orders_newest_first() {
        let now = Utc::now();
        let snap = |hours: i64, sell: f64| Snapshot {
            item_id: 1,
            buy_price: Some(sell - 1.0),
            sell_price: Some(sell),
            buy_count: None,
            sell_count: None,
            rank: None,
            taken_at: now - Duration::hours(hours),
        };
        let c = Candidate::new(Item::new(1, "x"), vec![snap(48, 10.0), snap(0, 12.0), snap(24, 11.0)]);
        assert_eq!(c.latest().and_then(|s| s.sell_price), Some(12.0));
        assert_eq!(c.sell_series(), vec![10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_repriced_recomputes_profit() {
        let opp = Opportunity {
            id: 1,
            name: "x".into(),
            current_buy_price: 10.0,
            current_sell_price: 12.0,
            avg_buy_price_7d: 10.0,
            avg_sell_price_7d: 12.0,
            profit_rate: 0.188,
            estimated_profit: 1.88,
            trend: Trend::Stable,
            risk: RiskLevel::Low,
            buy_order_count: 10,
            sell_order_count: 100,
            days_of_data: 7,
            rank: None,
            score: 50.0,
            recommended_buy_price: 10.1,
            recommended_quantity: 1,
            analysed_at: Utc::now(),
        };
        let repriced = opp.repriced(11.0, 12.0, 0.01);
        assert!((repriced.profit_rate - (11.88 - 11.0) / 11.0).abs() < 1e-9);
        assert_eq!(repriced.score, opp.score);
    }

    #[test]
    fn test_status_never_reverts() {
        assert!(PositionStatus::Holding.can_transition_to(PositionStatus::PartialSold));
        assert!(PositionStatus::PartialSold.can_transition_to(PositionStatus::StopLoss));
        assert!(!PositionStatus::PartialSold.can_transition_to(PositionStatus::Holding));
        assert!(!PositionStatus::StopLoss.can_transition_to(PositionStatus::FullySold));
        assert!(!PositionStatus::FullySold.can_transition_to(PositionStatus::PartialSold));
    }

    #[test]
    fn test_record_sale_clamps_to_remaining() {
        let mut pos = make_position(3);
        let sold = pos
            .record_sale(5, 120.0, 0.01, PositionStatus::FullySold, Utc::now())
            .unwrap();
        assert_eq!(sold, 3);
        assert_eq!(pos.sold_quantity, 3);
        assert_eq!(pos.remaining(), 0);
        assert!((pos.realized_profit - 3.0 * (118.8 - 100.0)).abs() < 1e-9);
    }

    #[test]
    fn test_record_sale_rejects_terminal() {
        let mut pos = make_position(2);
        pos.status = PositionStatus::StopLoss;
        assert!(pos
            .record_sale(1, 90.0, 0.01, PositionStatus::FullySold, Utc::now())
            .is_err());
    }

    #[test]
    fn test_forecast_day_lookup() {
        let f = Forecast {
            item_id: 1,
            current_price: 100.0,
            path: vec![101.0, 102.0, 103.0],
            confidence: 0.8,
        };
        assert_eq!(f.price_at_day(1), Some(101.0));
        assert_eq!(f.price_at_day(3), Some(103.0));
        assert_eq!(f.price_at_day(0), None);
        assert_eq!(f.price_at_day(4), None);
        assert!((f.change_at_day(3).unwrap() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!("partial_sold".parse::<PositionStatus>().unwrap(), PositionStatus::PartialSold);
        assert_eq!("DOWN".parse::<Trend>().unwrap(), Trend::Down);
        assert_eq!("value_first".parse::<PlanOrdering>().unwrap(), PlanOrdering::Value);
        assert!("sideways".parse::<Trend>().is_err());
    }

    #[test]
    fn test_error_display() {
        let e = ArbError::Order {
            item_id: 7,
            message: "connection reset".to_string(),
        };
        assert_eq!(format!("{e}"), "Order error (item 7): connection reset");
        assert_eq!(format!("{}", SourceError::RateLimited), "rate limited");
    }
}
