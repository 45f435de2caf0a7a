//! Mock marketplace for integration testing.
//!
//! Provides deterministic implementations of the price source, the
//! forecast service and order placement, all in-memory with no external
//! dependencies. Quotes, forecasts and failures are fully controllable
//! from test code, and every order is recorded.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use arbiter::sources::{Account, BuySide, ForecastSource, OrderRouter, PriceSource, SellSide};
use arbiter::storage::MemoryStore;
use arbiter::types::*;

#[derive(Debug, Clone, Copy)]
pub struct Book {
    pub buy: f64,
    pub buy_count: u32,
    pub sell: f64,
    pub sell_count: u32,
}

/// A recorded order: item, side, quantity, price.
pub type Placed = (ItemId, OrderSide, u32, f64);

#[derive(Default)]
pub struct MockMarket {
    books: Mutex<HashMap<ItemId, Book>>,
    failing: Mutex<HashSet<ItemId>>,
    forecasts: Mutex<HashMap<ItemId, Forecast>>,
    orders: Mutex<Vec<Placed>>,
}

impl MockMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the live book for an item.
    pub fn quote(&self, id: ItemId, buy: f64, sell: f64) {
        self.books.lock().unwrap().insert(
            id,
            Book {
                buy,
                buy_count: 20,
                sell,
                sell_count: 200,
            },
        );
    }

    /// Make every price request for `id` time out.
    pub fn fail_prices(&self, id: ItemId) {
        self.failing.lock().unwrap().insert(id);
    }

    /// Forecast a straight line from `current` to `target` over seven days.
    pub fn forecast(&self, id: ItemId, current: f64, target: f64) {
        let step = (target - current) / 7.0;
        let path = (1..=7).map(|d| current + step * f64::from(d)).collect();
        self.forecasts.lock().unwrap().insert(
            id,
            Forecast {
                item_id: id,
                current_price: current,
                path,
                confidence: 0.8,
            },
        );
    }

    pub fn orders(&self) -> Vec<Placed> {
        self.orders.lock().unwrap().clone()
    }

    pub fn bids(&self) -> Vec<Placed> {
        self.orders()
            .into_iter()
            .filter(|o| o.1 == OrderSide::Buy)
            .collect()
    }

    fn book(&self, id: ItemId) -> Result<Book, SourceError> {
        if self.failing.lock().unwrap().contains(&id) {
            return Err(SourceError::Timeout);
        }
        self.books
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .ok_or(SourceError::NotFound)
    }

    fn record(&self, id: ItemId, side: OrderSide, quantity: u32, price: f64) -> OrderReceipt {
        self.orders.lock().unwrap().push((id, side, quantity, price));
        OrderReceipt {
            order_id: Uuid::new_v4().to_string(),
            item_id: id,
            side,
            quantity,
            price,
            dry_run: false,
            placed_at: Utc::now(),
        }
    }
}

#[async_trait]
impl PriceSource for MockMarket {
    async fn best_buy(&self, _account: &Account, item_id: ItemId) -> Result<BuySide, SourceError> {
        self.book(item_id).map(|b| BuySide {
            price: b.buy,
            count: b.buy_count,
        })
    }

    async fn best_sell(&self, _account: &Account, item_id: ItemId) -> Result<SellSide, SourceError> {
        self.book(item_id).map(|b| SellSide {
            price: b.sell,
            count: b.sell_count,
        })
    }

    fn name(&self) -> &str {
        "mock_market"
    }
}

#[async_trait]
impl ForecastSource for MockMarket {
    async fn batch_forecast(&self, item_ids: &[ItemId], _horizon_days: u32) -> Result<HashMap<ItemId, Forecast>> {
        let forecasts = self.forecasts.lock().unwrap();
        Ok(item_ids
            .iter()
            .filter_map(|id| forecasts.get(id).map(|f| (*id, f.clone())))
            .collect())
    }
}

#[async_trait]
impl OrderRouter for MockMarket {
    async fn place_bid(
        &self,
        _account: &Account,
        item_id: ItemId,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, SourceError> {
        Ok(self.record(item_id, OrderSide::Buy, quantity, price))
    }

    async fn place_sell(
        &self,
        _account: &Account,
        position: &HoldingPosition,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, SourceError> {
        Ok(self.record(position.item_id, OrderSide::Sell, quantity, price))
    }
}

/// Seven daily snapshots at `buy`/`sell` with healthy liquidity.
pub fn week_of_history(id: ItemId, buy: f64, sell: f64) -> Vec<Snapshot> {
    let now = Utc::now();
    (0..7)
        .map(|d| Snapshot {
            item_id: id,
            buy_price: Some(buy),
            sell_price: Some(sell),
            buy_count: Some(20),
            sell_count: Some(200),
            rank: None,
            taken_at: now - Duration::hours(d * 24 + 1),
        })
        .collect()
}

/// Add an item and its history to the catalog.
pub fn list_item(store: &MemoryStore, id: ItemId, name: &str, buy: f64, sell: f64) {
    store.add_item(Item::new(id, name));
    for snap in week_of_history(id, buy, sell) {
        store.add_snapshot(snap);
    }
}
