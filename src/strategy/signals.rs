//! Market signals derived from item names and price history.
//!
//! All functions here are pure. They feed the opportunity builder (trend
//! and risk tiers) and the enrichment pool (bottom-rebound detection).

use chrono::{DateTime, Utc};

use crate::config::EnrichmentConfig;
use crate::types::{Forecast, LookbackWindow, ReboundSignal, RiskLevel, Snapshot, Trend};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Forecast change beyond which a trend is called.
const FORECAST_TREND_BAND: f64 = 0.05;

/// Below this R² the regression slope is ignored.
const MIN_R_SQUARED: f64 = 0.3;

const LOW_VOLATILITY: f64 = 0.08;
const HIGH_VOLATILITY: f64 = 0.15;

/// Profit rates above this look too good to be stable.
const SUSPICIOUS_PROFIT_RATE: f64 = 0.30;

// ---------------------------------------------------------------------------
// Name-derived attributes
// ---------------------------------------------------------------------------

/// Condition tier from the exterior in the item name (5 = Factory New).
pub fn wear_tier(name: &str) -> f64 {
    const TIERS: [(&str, f64); 5] = [
        ("Factory New", 5.0),
        ("Minimal Wear", 4.0),
        ("Field-Tested", 3.0),
        ("Well-Worn", 2.0),
        ("Battle-Scarred", 1.0),
    ];
    TIERS
        .iter()
        .find(|(label, _)| name.contains(label))
        .map(|(_, tier)| *tier)
        .unwrap_or(2.5)
}

pub fn is_popular(name: &str, popular_keywords: &[String]) -> bool {
    let lower = name.to_lowercase();
    popular_keywords
        .iter()
        .any(|k| lower.contains(&k.to_lowercase()))
}

pub fn is_stattrak(name: &str) -> bool {
    name.contains("StatTrak")
}

// ---------------------------------------------------------------------------
// Trend
// ---------------------------------------------------------------------------

/// Trend implied by the forecast at `horizon_days`, relative to `base_price`.
pub fn trend_from_forecast(forecast: &Forecast, base_price: f64, horizon_days: u32) -> Option<Trend> {
    let predicted = forecast.price_at_day(horizon_days)?;
    if predicted <= 0.0 || base_price <= 0.0 {
        return None;
    }
    let diff = (predicted - base_price) / base_price;
    Some(if diff > FORECAST_TREND_BAND {
        Trend::Up
    } else if diff < -FORECAST_TREND_BAND {
        Trend::Down
    } else {
        Trend::Stable
    })
}

/// Least-squares fit over prices in chronological order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub r_squared: f64,
    pub mean: f64,
}

pub fn linear_fit(prices: &[f64]) -> Option<LinearFit> {
    let n = prices.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = prices.iter().sum::<f64>() / nf;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (i, y) in prices.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };
    Some(LinearFit {
        slope,
        r_squared,
        mean: mean_y,
    })
}

/// Trend from a chronological price series.
///
/// A weak fit falls back to comparing the last price with the series peak.
pub fn regression_trend(prices: &[f64]) -> Trend {
    if prices.len() < 3 {
        return Trend::Unknown;
    }
    let Some(fit) = linear_fit(prices) else {
        return Trend::Unknown;
    };
    if fit.mean <= 0.0 {
        return Trend::Unknown;
    }

    if fit.r_squared < MIN_R_SQUARED {
        let last = prices[prices.len() - 1];
        let peak = prices.iter().copied().fold(f64::MIN, f64::max);
        let change = (last - peak) / peak;
        return if change <= -0.01 {
            Trend::Down
        } else if change >= 0.01 {
            Trend::Up
        } else {
            Trend::Stable
        };
    }

    let slope_pct = fit.slope / fit.mean * 100.0;
    if slope_pct > 1.0 {
        Trend::Up
    } else if slope_pct < -1.0 {
        Trend::Down
    } else {
        Trend::Stable
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Population standard deviation over mean.
pub fn coefficient_of_variation(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 {
        return None;
    }
    let n = prices.len() as f64;
    let mean = prices.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean)
}

/// Everything the risk tier depends on.
#[derive(Debug, Clone)]
pub struct RiskInputs<'a> {
    pub sell_history: &'a [f64],
    pub has_enough_history: bool,
    pub buy_count: u32,
    pub sell_count: u32,
    pub profit_rate: f64,
    pub popular: bool,
    pub wear: f64,
    pub stattrak: bool,
}

pub fn classify_risk(inputs: &RiskInputs<'_>) -> RiskLevel {
    let volatility = if inputs.has_enough_history {
        coefficient_of_variation(inputs.sell_history)
    } else {
        None
    };

    let mut risk = match volatility {
        Some(cv) if cv < LOW_VOLATILITY => RiskLevel::Low,
        Some(cv) if cv > HIGH_VOLATILITY => RiskLevel::High,
        Some(_) => RiskLevel::Medium,
        None => market_risk(inputs),
    };

    if inputs.profit_rate > SUSPICIOUS_PROFIT_RATE {
        risk = RiskLevel::High;
    }

    if inputs.stattrak {
        risk = match risk {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium if inputs.wear <= 2.0 => RiskLevel::High,
            other => other,
        };
    }
    risk
}

/// Depth-and-category heuristic for items without enough history.
fn market_risk(inputs: &RiskInputs<'_>) -> RiskLevel {
    let mut score = 0;
    if inputs.buy_count >= 50 {
        score += 2;
    }
    if inputs.sell_count >= 150 {
        score += 2;
    }
    if (0.10..=0.25).contains(&inputs.profit_rate) {
        score += 2;
    }
    if inputs.popular {
        score += 1;
    }
    if inputs.wear >= 4.0 {
        score += 1;
    }
    match score {
        s if s >= 6 => RiskLevel::Low,
        s if s <= 3 => RiskLevel::High,
        _ => RiskLevel::Medium,
    }
}

// ---------------------------------------------------------------------------
// Bottom rebound
// ---------------------------------------------------------------------------

impl LookbackWindow {
    /// Accepted snapshot age range in hours.
    fn hours(&self) -> (i64, i64) {
        match self {
            LookbackWindow::OneDay => (23, 25),
            LookbackWindow::TwoDays => (47, 49),
            LookbackWindow::ThreeDays => (71, 73),
            LookbackWindow::SevenDays => (156, 180),
            LookbackWindow::ThirtyDays => (672, 768),
        }
    }
}

/// Sell price of the newest snapshot inside `window`.
fn price_in_window(snapshots: &[Snapshot], now: DateTime<Utc>, window: LookbackWindow) -> Option<f64> {
    let (lo, hi) = window.hours();
    snapshots
        .iter()
        .filter(|s| {
            let age = (now - s.taken_at).num_hours();
            age >= lo && age <= hi
        })
        .find_map(|s| s.sell_price.filter(|p| *p > 0.0))
}

/// Detect a recent decline followed by a bounded recovery.
///
/// `snapshots` are newest first. Returns `None` when the history shows a
/// steady rise, a steady fall, no qualifying decline, a recovery outside
/// the configured bands, or a one-day spike.
pub fn detect_bottom_rebound(
    current_sell: f64,
    snapshots: &[Snapshot],
    now: DateTime<Utc>,
    cfg: &EnrichmentConfig,
) -> Option<ReboundSignal> {
    if current_sell <= 0.0 {
        return None;
    }
    let rate = |w: LookbackWindow| {
        price_in_window(snapshots, now, w).map(|p| (current_sell - p) / p)
    };
    let r1 = rate(LookbackWindow::OneDay);
    let r2 = rate(LookbackWindow::TwoDays);
    let r3 = rate(LookbackWindow::ThreeDays);
    let r7 = rate(LookbackWindow::SevenDays);
    let r30 = rate(LookbackWindow::ThirtyDays);

    let pos = |r: Option<f64>| matches!(r, Some(v) if v > 0.0);
    let neg = |r: Option<f64>| matches!(r, Some(v) if v < 0.0);

    // Still climbing, or still falling on every horizon.
    if pos(r1) && pos(r7) {
        return None;
    }
    if neg(r1) && neg(r7) && neg(r30) {
        return None;
    }

    let (decline, decline_window) = match (r7, r3, r2, r1) {
        (Some(v), _, _, _) if v < -0.04 => (v, LookbackWindow::SevenDays),
        (_, Some(v), _, _) if v < -0.04 => (v * 1.5, LookbackWindow::ThreeDays),
        (_, _, Some(v), _) if v < -0.03 => (v, LookbackWindow::TwoDays),
        (_, _, _, Some(v)) if v < -0.05 => (v, LookbackWindow::OneDay),
        _ => return None,
    };

    let (rebound, rebound_window) = [
        (r1, LookbackWindow::OneDay),
        (r2, LookbackWindow::TwoDays),
        (r3, LookbackWindow::ThreeDays),
    ]
    .into_iter()
    .find_map(|(r, w)| r.filter(|v| *v > 0.0).map(|v| (v, w)))?;

    let recovery = rebound / -decline;
    let recovery_ok = recovery >= cfg.min_rebound && recovery <= cfg.max_rebound;
    let absolute_ok = rebound >= cfg.min_rebound_abs && rebound <= cfg.max_rebound_1d;
    let spike = rebound_window == LookbackWindow::OneDay && rebound > cfg.max_rebound_1d;

    if (recovery_ok || absolute_ok) && !spike {
        Some(ReboundSignal {
            decline,
            decline_window,
            rebound,
            rebound_window,
            recovery,
        })
    } else {
        None
    }
}
