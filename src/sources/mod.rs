//! External collaborators.
//!
//! Defines the traits the pipeline consumes and the account pool used to
//! pick a marketplace identity per worker:
//! - `PriceSource`: best live buy/sell prices for one item
//! - `ForecastSource`: batched multi-day price forecasts
//! - `OrderRouter`: bid placement and liquidation
//!
//! `gateway` and `forecast` provide the HTTP implementations.

pub mod forecast;
pub mod gateway;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::config::{AccountConfig, AppConfig};
use crate::types::{Forecast, HoldingPosition, ItemId, OrderReceipt, SourceError};

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// A marketplace identity. Rate limits are enforced per identity.
pub struct Account {
    pub name: String,
    token: SecretString,
}

impl Account {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: SecretString::new(token.into()),
        }
    }

    /// Identity used in tests and dry runs.
    pub fn anonymous() -> Self {
        Self::new("anonymous", "")
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().is_empty()
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Round-robin credential selector shared by every pool.
#[derive(Debug, Clone)]
pub struct AccountPool {
    accounts: Vec<Arc<Account>>,
}

impl AccountPool {
    /// Always holds at least one account; an empty list gets `anonymous`.
    pub fn new(accounts: Vec<Account>) -> Self {
        let mut accounts: Vec<Arc<Account>> = accounts.into_iter().map(Arc::new).collect();
        if accounts.is_empty() {
            accounts.push(Arc::new(Account::anonymous()));
        }
        Self { accounts }
    }

    /// Resolve tokens from the environment, skipping accounts whose variable is unset.
    pub fn from_config(configs: &[AccountConfig]) -> Self {
        let accounts = configs
            .iter()
            .filter_map(|c| match AppConfig::resolve_env(&c.token_env) {
                Ok(token) => Some(Account::new(&c.name, token)),
                Err(e) => {
                    warn!(account = %c.name, error = %e, "Token not set, account skipped");
                    None
                }
            })
            .collect();
        Self::new(accounts)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Account assigned to worker `idx`.
    pub fn for_worker(&self, idx: usize) -> Arc<Account> {
        Arc::clone(&self.accounts[idx % self.accounts.len()])
    }

    pub fn all(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    /// A pool restricted to a single account, for sharded runs.
    pub fn single(account: Arc<Account>) -> Self {
        Self {
            accounts: vec![account],
        }
    }

    /// True when at least one account carries real credentials.
    pub fn has_credentials(&self) -> bool {
        self.accounts.iter().any(|a| a.has_token())
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Best standing purchase order for an item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuySide {
    pub price: f64,
    /// Number of standing purchase orders.
    pub count: u32,
}

/// Cheapest listing for an item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellSide {
    pub price: f64,
    /// Number of active listings.
    pub count: u32,
}

/// Live marketplace prices. Callers throttle per account.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn best_buy(&self, account: &Account, item_id: ItemId) -> Result<BuySide, SourceError>;

    async fn best_sell(&self, account: &Account, item_id: ItemId) -> Result<SellSide, SourceError>;

    fn name(&self) -> &str;
}

/// Batched price forecasts.
///
/// A batch that fails returns `Err`; items the service could not forecast
/// are simply missing from the map.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn batch_forecast(
        &self,
        item_ids: &[ItemId],
        horizon_days: u32,
    ) -> Result<HashMap<ItemId, Forecast>>;
}

/// Order placement on the marketplace.
#[async_trait]
pub trait OrderRouter: Send + Sync {
    /// Place a standing purchase order.
    async fn place_bid(
        &self,
        account: &Account,
        item_id: ItemId,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, SourceError>;

    /// List units of a held position for sale.
    async fn place_sell(
        &self,
        account: &Account,
        position: &HoldingPosition,
        quantity: u32,
        price: f64,
    ) -> Result<OrderReceipt, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_gets_anonymous() {
        let pool = AccountPool::new(Vec::new());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.for_worker(7).name, "anonymous");
        assert!(!pool.has_credentials());
    }

    #[test]
    fn test_round_robin_assignment() {
        let pool = AccountPool::new(vec![Account::new("a", "t1"), Account::new("b", "t2")]);
        assert_eq!(pool.for_worker(0).name, "a");
        assert_eq!(pool.for_worker(1).name, "b");
        assert_eq!(pool.for_worker(2).name, "a");
        assert!(pool.has_credentials());
    }

    #[test]
    fn test_debug_redacts_token() {
        let account = Account::new("main", "super-secret");
        let out = format!("{account:?}");
        assert!(!out.contains("super-secret"));
        assert_eq!(account.token(), "super-secret");
    }

    #[test]
    fn test_from_config_skips_missing_env() {
        let configs = vec![AccountConfig {
            name: "ghost".to_string(),
            token_env: "ARBITER_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
        }];
        let pool = AccountPool::from_config(&configs);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.for_worker(0).name, "anonymous");
    }

    #[test]
    fn test_from_config_resolves_env_token() {
        std::env::set_var("ARBITER_TEST_TOKEN_RESOLVED", "secret-token");
        let configs = vec![AccountConfig {
            name: "main".to_string(),
            token_env: "ARBITER_TEST_TOKEN_RESOLVED".to_string(),
        }];
        let pool = AccountPool::from_config(&configs);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.for_worker(0).name, "main");
        assert!(pool.has_credentials());
    }
}
