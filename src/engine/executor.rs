//! Order executor.
//!
//! Routes bids and liquidation listings to the marketplace. In dry-run
//! mode nothing leaves the process: the order is logged and a synthetic
//! receipt is returned. Dry run is the default whenever no account
//! carries real credentials.

use std::sync::Arc;
use tracing::{info, warn};

use crate::sources::{Account, OrderRouter};
use crate::types::{ArbError, HoldingPosition, ItemId, OrderReceipt, OrderSide};

pub struct Executor {
    router: Option<Arc<dyn OrderRouter>>,
    dry_run: bool,
}

impl Executor {
    pub fn new(router: Option<Arc<dyn OrderRouter>>, dry_run: bool) -> Self {
        Self { router, dry_run }
    }

    /// An executor that only simulates.
    pub fn simulated() -> Self {
        Self::new(None, true)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Place one standing purchase order.
    pub async fn submit_bid(
        &self,
        account: &Account,
        item_id: ItemId,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, ArbError> {
        if self.dry_run {
            info!(
                item_id,
                quantity,
                price = format!("{:.2}", price),
                "[DRY RUN] Would place bid"
            );
            return Ok(OrderReceipt::dry_run(item_id, OrderSide::Buy, quantity, price));
        }

        let router = self.router()?;
        match router.place_bid(account, item_id, quantity, price).await {
            Ok(receipt) => {
                info!(
                    item_id,
                    quantity,
                    price = format!("{:.2}", price),
                    order_id = %receipt.order_id,
                    account = %account.name,
                    "Bid placed"
                );
                Ok(receipt)
            }
            Err(e) => {
                warn!(item_id, error = %e, "Bid placement failed");
                Err(ArbError::Order {
                    item_id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// List `quantity` units of a held position.
    pub async fn submit_sell(
        &self,
        account: &Account,
        position: &HoldingPosition,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, ArbError> {
        let item_id = position.item_id;
        if self.dry_run {
            info!(
                item_id,
                quantity,
                price = format!("{:.2}", price),
                "[DRY RUN] Would list for sale"
            );
            return Ok(OrderReceipt::dry_run(item_id, OrderSide::Sell, quantity, price));
        }

        let router = self.router()?;
        router
            .place_sell(account, position, quantity, price)
            .await
            .map_err(|e| {
                warn!(item_id, error = %e, "Sell listing failed");
                ArbError::Order {
                    item_id,
                    message: e.to_string(),
                }
            })
    }

    fn router(&self) -> Result<&Arc<dyn OrderRouter>, ArbError> {
        self.router.as_ref().ok_or_else(|| ArbError::Order {
            item_id: 0,
            message: "no order router configured".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{live_receipt, MockRouter};
    use crate::types::SourceError;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_dry_run_bid() {
        let executor = Executor::simulated();
        let receipt = executor
            .submit_bid(&Account::anonymous(), 7, 2, 10.1)
            .await
            .unwrap();
        assert!(receipt.dry_run);
        assert!(receipt.order_id.starts_with("dry-"));
        assert_eq!(receipt.side, OrderSide::Buy);
        assert_eq!(receipt.quantity, 2);
    }

    #[tokio::test]
    async fn test_live_without_router_fails() {
        let executor = Executor::new(None, false);
        let err = executor
            .submit_bid(&Account::anonymous(), 7, 1, 10.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no order router"));
    }

    #[tokio::test]
    async fn test_live_bid_routes_once() {
        let mut router = MockRouter::new();
        router
            .expect_place_bid()
            .with(mockall::predicate::always(), eq(7), eq(1), eq(10.5))
            .times(1)
            .returning(|_, id, qty, price| Ok(live_receipt(id, OrderSide::Buy, qty, price)));

        let executor = Executor::new(Some(Arc::new(router)), false);
        let receipt = executor
            .submit_bid(&Account::new("primary", "tok"), 7, 1, 10.5)
            .await
            .unwrap();
        assert!(!receipt.dry_run);
    }

    #[tokio::test]
    async fn test_router_error_is_order_error() {
        let mut router = MockRouter::new();
        router
            .expect_place_bid()
            .returning(|_, _, _, _| Err(SourceError::RateLimited));

        let executor = Executor::new(Some(Arc::new(router)), false);
        let err = executor
            .submit_bid(&Account::anonymous(), 9, 1, 3.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbError::Order { item_id: 9, .. }));
    }
}
