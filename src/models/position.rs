//! # models::position
//!
//! Open positions as reported by a broker.
//!
//! Positions are never mutated locally after a fill: the broker is the source
//! of truth and every cycle re-fetches them, so a timed-out close cannot be
//! double-counted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::account::{AccountId, ConnectionId};
use crate::models::order::Side;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Always positive; direction lives in `side`.
    pub quantity: f64,
    pub entry_price: f64,
    /// Latest mark from the broker. Falls back to `entry_price` when absent.
    #[serde(default)]
    pub mark_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub account: AccountId,
    pub connection: ConnectionId,
}

impl Position {
    #[inline]
    pub fn price(&self) -> f64 {
        self.mark_price.unwrap_or(self.entry_price)
    }

    /// Notional value in quote currency.
    #[inline]
    pub fn value(&self) -> f64 {
        (self.quantity * self.price()).abs()
    }

    /// Key used by the unwind ledger: one position per symbol per connection.
    pub fn key(&self) -> PositionKey {
        PositionKey {
            connection: self.connection.clone(),
            symbol: self.symbol.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub connection: ConnectionId,
    pub symbol: String,
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.connection, self.symbol)
    }
}
