//! Marketplace price gateway.
//!
//! Thin JSON client for the internal gateway that fronts the marketplace.
//! The gateway owns request signing; this side only attaches the account
//! token as a bearer credential.
//!
//! Endpoints:
//! - `GET  /v1/items/{id}/best-buy`  → `{ "price": f64, "count": u32 }`
//! - `GET  /v1/items/{id}/best-sell` → `{ "price": f64, "count": u32 }`
//! - `POST /v1/items/{id}/bids`      → `{ "order_id": string }`
//! - `POST /v1/items/{id}/listings`  → `{ "order_id": string }`

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Account, BuySide, OrderRouter, PriceSource, SellSide};
use crate::types::{HoldingPosition, ItemId, OrderReceipt, OrderSide, SourceError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const SOURCE_NAME: &str = "gateway";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SideResponse {
    #[serde(default)]
    price: f64,
    #[serde(default)]
    count: u32,
}

#[derive(Debug, Serialize)]
struct OrderRequest {
    quantity: u32,
    price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    position_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpPriceGateway {
    http: Client,
    base_url: String,
}

impl HttpPriceGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("arbiter/0.1")
            .build()
            .context("Failed to build gateway HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn item_url(&self, item_id: ItemId, tail: &str) -> String {
        format!("{}/v1/items/{item_id}/{tail}", self.base_url)
    }

    fn authed(&self, req: RequestBuilder, account: &Account) -> RequestBuilder {
        if account.has_token() {
            req.bearer_auth(account.token())
        } else {
            req
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, SourceError> {
        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }
        resp.json::<T>()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }

    async fn fetch_side(
        &self,
        account: &Account,
        item_id: ItemId,
        tail: &str,
    ) -> Result<SideResponse, SourceError> {
        let req = self.authed(self.http.get(self.item_url(item_id, tail)), account);
        let side: SideResponse = self.send_json(req).await?;
        debug!(item_id, side = tail, price = side.price, count = side.count, "Gateway quote");
        Ok(side)
    }

    async fn submit_order(
        &self,
        account: &Account,
        item_id: ItemId,
        tail: &str,
        side: OrderSide,
        body: OrderRequest,
    ) -> Result<OrderReceipt, SourceError> {
        let quantity = body.quantity;
        let price = body.price;
        let req = self
            .authed(self.http.post(self.item_url(item_id, tail)), account)
            .json(&body);
        let resp: OrderResponse = self.send_json(req).await?;
        Ok(OrderReceipt {
            order_id: resp.order_id,
            item_id,
            side,
            quantity,
            price,
            dry_run: false,
            placed_at: Utc::now(),
        })
    }
}

fn classify_status(status: StatusCode) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited,
        StatusCode::NOT_FOUND => SourceError::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SourceError::Timeout,
        other => SourceError::Unavailable(format!("HTTP {other}")),
    })
}

fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl PriceSource for HttpPriceGateway {
    async fn best_buy(&self, account: &Account, item_id: ItemId) -> Result<BuySide, SourceError> {
        let side = self.fetch_side(account, item_id, "best-buy").await?;
        Ok(BuySide {
            price: side.price,
            count: side.count,
        })
    }

    async fn best_sell(&self, account: &Account, item_id: ItemId) -> Result<SellSide, SourceError> {
        let side = self.fetch_side(account, item_id, "best-sell").await?;
        Ok(SellSide {
            price: side.price,
            count: side.count,
        })
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

#[async_trait]
impl OrderRouter for HttpPriceGateway {
    async fn place_bid(
        &self,
        account: &Account,
        item_id: ItemId,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, SourceError> {
        let body = OrderRequest {
            quantity,
            price,
            position_id: None,
        };
        self.submit_order(account, item_id, "bids", OrderSide::Buy, body)
            .await
    }

    async fn place_sell(
        &self,
        account: &Account,
        position: &HoldingPosition,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, SourceError> {
        let body = OrderRequest {
            quantity,
            price,
            position_id: Some(position.id),
        };
        self.submit_order(account, position.item_id, "listings", OrderSide::Sell, body)
            .await
    }
}
