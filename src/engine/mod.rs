//! Core engine: the pass orchestrator and its concurrent stages.
//!
//! catalog → coarse forecast → enrich → precise forecast → analyse →
//! allocate → verify → commit, plus the independent position sweep.

pub mod enricher;
pub mod executor;
pub mod fetcher;
pub mod pipeline;
pub mod pool;
pub mod positions;
pub mod predictor;
pub mod verifier;

#[cfg(test)]
pub(crate) mod fixtures {
    //! Deterministic in-memory price source for engine unit tests.

    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::mock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::sources::{Account, BuySide, OrderRouter, PriceSource, SellSide};
    use crate::types::{HoldingPosition, ItemId, OrderReceipt, OrderSide, SourceError};

    mock! {
        pub Router {}

        #[async_trait]
        impl OrderRouter for Router {
            async fn place_bid(
                &self,
                account: &Account,
                item_id: ItemId,
                quantity: u32,
                price: f64,
            ) -> Result<OrderReceipt, SourceError>;

            async fn place_sell(
                &self,
                account: &Account,
                position: &HoldingPosition,
                quantity: u32,
                price: f64,
            ) -> Result<OrderReceipt, SourceError>;
        }
    }

    /// Receipt as a live router would return it.
    pub(crate) fn live_receipt(item_id: ItemId, side: OrderSide, quantity: u32, price: f64) -> OrderReceipt {
        OrderReceipt {
            order_id: format!("live-{item_id}"),
            item_id,
            side,
            quantity,
            price,
            dry_run: false,
            placed_at: Utc::now(),
        }
    }

    type Script = Result<(BuySide, SellSide), SourceError>;

    #[derive(Default)]
    pub(crate) struct ScriptedPrices {
        quotes: Mutex<HashMap<ItemId, Script>>,
        delay: Mutex<Duration>,
        calls: AtomicU64,
    }

    impl ScriptedPrices {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn set(&self, id: ItemId, buy: f64, buy_count: u32, sell: f64, sell_count: u32) {
            self.quotes.lock().unwrap().insert(
                id,
                Ok((
                    BuySide { price: buy, count: buy_count },
                    SellSide { price: sell, count: sell_count },
                )),
            );
        }

        pub(crate) fn fail(&self, id: ItemId, err: SourceError) {
            self.quotes.lock().unwrap().insert(id, Err(err));
        }

        pub(crate) fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        pub(crate) fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }

        async fn lookup(&self, id: ItemId) -> Script {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.quotes
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .unwrap_or(Err(SourceError::NotFound))
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedPrices {
        async fn best_buy(&self, _account: &Account, item_id: ItemId) -> Result<BuySide, SourceError> {
            self.lookup(item_id).await.map(|(b, _)| b)
        }

        async fn best_sell(&self, _account: &Account, item_id: ItemId) -> Result<SellSide, SourceError> {
            self.lookup(item_id).await.map(|(_, s)| s)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
