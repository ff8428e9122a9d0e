//! # models::order
//!
//! Order requests, broker acknowledgements, decision-engine actions and the
//! market snapshot handed to the decision engine each cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::account::{AccountId, ConnectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// What the orchestrator hands to a broker. `nonce` is filled in by the
/// gateway when the exchange requires one; signing is the broker's job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// `true` for exits, so a broker never opens a position with it.
    pub reduce_only: bool,
    pub nonce: Option<i64>,
}

impl OrderRequest {
    pub fn open(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            quantity,
            reduce_only: false,
            nonce: None,
        }
    }

    pub fn close(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            reduce_only: true,
            ..Self::open(symbol, side, quantity)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_quantity: f64,
    pub average_price: f64,
}

/// Output of the decision engine. The orchestrator decides whether and how
/// each action reaches the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Open { symbol: String, side: Side, quantity: f64 },
    /// `quantity: None` closes the whole position.
    Close { symbol: String, quantity: Option<f64> },
}

/// Per-cycle view given to the decision engine.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub account: AccountId,
    pub connection: ConnectionId,
    pub balance: f64,
    pub taken_at: DateTime<Utc>,
}
