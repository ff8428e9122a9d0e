//! # broker
//!
//! The seam between the orchestrator and exchange adapters.
//!
//! Wire protocols and request signing live behind [`BrokerCapability`]; the
//! orchestrator only sees balances, positions and order acknowledgements.
//! [`BrokerFactory`] binds an adapter to one [`ExchangeConnection`] so every
//! worker talks to its own instance.

pub mod paper;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BrokerError, ConfigError};
use crate::models::{AccountId, ExchangeConnection, OrderRequest, OrderResult, Position};

#[async_trait]
pub trait BrokerCapability: Send + Sync {
    async fn get_balance(&self, account: &AccountId) -> Result<f64, BrokerError>;

    async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError>;

    /// `order.nonce` is set when [`requires_nonce`](Self::requires_nonce) is true.
    async fn place_order(
        &self,
        account: &AccountId,
        order: &OrderRequest,
    ) -> Result<OrderResult, BrokerError>;

    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError>;

    fn requires_nonce(&self) -> bool;

    /// Smallest order notional (quote currency) accepted for `symbol`.
    fn min_notional(&self, _symbol: &str) -> f64 {
        0.0
    }
}

pub type SharedBroker = Arc<dyn BrokerCapability>;

pub trait BrokerFactory: Send + Sync {
    fn connect(&self, connection: &Arc<ExchangeConnection>) -> Result<SharedBroker, ConfigError>;
}
