//! # broker::paper
//!
//! In-memory broker used for paper trading and by the test suite.
//!
//! Fills every order immediately at the configured mark price, enforces
//! strictly increasing nonces when asked to, and can be scripted to fail the
//! next N calls with a chosen [`BrokerError`] or to respond slowly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::broker::{BrokerCapability, BrokerFactory, SharedBroker};
use crate::config::{env_list, env_or};
use crate::error::{BrokerError, ConfigError};
use crate::models::{
    AccountId, ConnectionId, ExchangeConnection, OrderRequest, OrderResult, Position,
};

const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
struct PaperBook {
    balance: f64,
    positions: HashMap<String, Position>,
    marks: HashMap<String, f64>,
    halted: HashSet<String>,
    failures: VecDeque<BrokerError>,
    last_nonce: Option<i64>,
    filled: Vec<OrderRequest>,
    cancelled: Vec<String>,
}

pub struct PaperBroker {
    connection: ConnectionId,
    book: Mutex<PaperBook>,
    requires_nonce: bool,
    min_notional: f64,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl PaperBroker {
    pub fn new(connection: ConnectionId, balance: f64) -> Self {
        Self {
            connection,
            book: Mutex::new(PaperBook {
                balance,
                ..PaperBook::default()
            }),
            requires_nonce: false,
            min_notional: 0.0,
            latency: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_nonce(mut self) -> Self {
        self.requires_nonce = true;
        self
    }

    pub fn with_min_notional(mut self, min_notional: f64) -> Self {
        self.min_notional = min_notional;
        self
    }

    pub fn set_mark(&self, symbol: &str, price: f64) {
        let mut book = self.book.lock();
        book.marks.insert(symbol.to_string(), price);
        if let Some(pos) = book.positions.get_mut(symbol) {
            pos.mark_price = Some(price);
        }
    }

    async fn enter(&self) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.book.lock().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_fill(book: &mut PaperBook, connection: &ConnectionId, order: &OrderRequest, price: f64) -> Result<f64, BrokerError> {
        let existing = book.positions.get(&order.symbol).cloned();
        match existing {
            Some(mut pos) if pos.side != order.side => {
                let closed = order.quantity.min(pos.quantity);
                pos.quantity -= closed;
                if pos.quantity <= QTY_EPSILON {
                    book.positions.remove(&order.symbol);
                } else {
                    book.positions.insert(order.symbol.clone(), pos);
                }
                Ok(closed)
            }
            _ if order.reduce_only => Err(BrokerError::Rejected(format!(
                "reduce-only order for {} with no opposing position",
                order.symbol
            ))),
            Some(mut pos) => {
                let total = pos.quantity + order.quantity;
                pos.entry_price = (pos.entry_price * pos.quantity + price * order.quantity) / total;
                pos.quantity = total;
                book.positions.insert(order.symbol.clone(), pos);
                Ok(order.quantity)
            }
            None => {
                book.positions.insert(
                    order.symbol.clone(),
                    Position {
                        symbol: order.symbol.clone(),
                        side: order.side,
                        quantity: order.quantity,
                        entry_price: price,
                        mark_price: Some(price),
                        opened_at: Utc::now(),
                        account: connection.account.clone(),
                        connection: connection.clone(),
                    },
                );
                Ok(order.quantity)
            }
        }
    }
}

/// Scripting hooks for tests.
#[cfg(test)]
impl PaperBroker {
    pub fn set_balance(&self, balance: f64) {
        self.book.lock().balance = balance;
    }

    /// Seed an already-open position, e.g. one inherited from before a restart.
    pub fn seed_position(&self, symbol: &str, side: crate::models::Side, quantity: f64, price: f64, age: chrono::Duration) {
        let mut book = self.book.lock();
        book.marks.insert(symbol.to_string(), price);
        book.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side,
                quantity,
                entry_price: price,
                mark_price: Some(price),
                opened_at: Utc::now() - age,
                account: self.connection.account.clone(),
                connection: self.connection.clone(),
            },
        );
    }

    /// Reject every order on `symbol` until further notice.
    pub fn halt(&self, symbol: &str) {
        self.book.lock().halted.insert(symbol.to_string());
    }

    /// The next `count` calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: BrokerError) {
        let mut book = self.book.lock();
        book.failures.extend(std::iter::repeat(error).take(count));
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn filled_orders(&self) -> Vec<OrderRequest> {
        self.book.lock().filled.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.book.lock().cancelled.clone()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.book.lock().positions.get(symbol).cloned()
    }
}

#[async_trait]
impl BrokerCapability for PaperBroker {
    async fn get_balance(&self, _account: &AccountId) -> Result<f64, BrokerError> {
        self.enter().await?;
        Ok(self.book.lock().balance)
    }

    async fn get_positions(&self, _account: &AccountId) -> Result<Vec<Position>, BrokerError> {
        self.enter().await?;
        let book = self.book.lock();
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_order(
        &self,
        _account: &AccountId,
        order: &OrderRequest,
    ) -> Result<OrderResult, BrokerError> {
        self.enter().await?;
        let mut book = self.book.lock();

        if self.requires_nonce {
            match (order.nonce, book.last_nonce) {
                (None, _) => return Err(BrokerError::InvalidNonce),
                (Some(n), Some(last)) if n <= last => return Err(BrokerError::InvalidNonce),
                (Some(n), _) => book.last_nonce = Some(n),
            }
        }

        let price = *book
            .marks
            .get(&order.symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("no market for {}", order.symbol)))?;
        if book.halted.contains(&order.symbol) {
            return Err(BrokerError::Rejected(format!("market {} halted", order.symbol)));
        }
        if order.quantity <= 0.0 {
            return Err(BrokerError::Rejected("quantity must be positive".into()));
        }
        if !order.reduce_only && order.quantity * price < self.min_notional {
            return Err(BrokerError::Rejected("below minimum notional".into()));
        }

        let filled = Self::apply_fill(&mut book, &self.connection, order, price)?;
        book.filled.push(order.clone());
        debug!(connection = %self.connection, symbol = %order.symbol, side = ?order.side, filled, price, "paper fill");

        Ok(OrderResult {
            order_id: order.client_order_id.to_string(),
            filled_quantity: filled,
            average_price: price,
        })
    }

    async fn cancel_order(&self, _account: &AccountId, order_id: &str) -> Result<(), BrokerError> {
        // Paper orders fill immediately, so there is never anything resting.
        self.enter().await?;
        self.book.lock().cancelled.push(order_id.to_string());
        Ok(())
    }

    fn requires_nonce(&self) -> bool {
        self.requires_nonce
    }

    fn min_notional(&self, _symbol: &str) -> f64 {
        self.min_notional
    }
}

// ─── Factory ──────────────────────────────────────────────────────────────────

/// Builds one [`PaperBroker`] per connection and keeps a handle to each so
/// callers (tests, drills) can script them.
pub struct PaperBrokerFactory {
    starting_balance: f64,
    min_notional: f64,
    marks: Vec<(String, f64)>,
    brokers: Mutex<HashMap<ConnectionId, Arc<PaperBroker>>>,
}

impl PaperBrokerFactory {
    pub fn new(starting_balance: f64, min_notional: f64) -> Self {
        Self {
            starting_balance,
            min_notional,
            marks: Vec::new(),
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// `PAPER_MARKS=BTC=65000,ETH=3100` seeds the prices paper orders fill at.
    pub fn from_env() -> Self {
        let mut factory = Self::new(env_or("PAPER_BALANCE", 10_000.0), env_or("MIN_NOTIONAL", 5.0));
        factory.marks = env_list("PAPER_MARKS")
            .iter()
            .filter_map(|pair| {
                let (symbol, price) = pair.split_once('=')?;
                Some((symbol.trim().to_string(), price.trim().parse().ok()?))
            })
            .collect();
        factory
    }

    /// Pre-build the broker for a connection so it can be scripted before
    /// any worker connects.
    pub fn prepare(&self, connection: &ConnectionId, requires_nonce: bool) -> Arc<PaperBroker> {
        let mut brokers = self.brokers.lock();
        let broker = brokers.entry(connection.clone()).or_insert_with(|| {
            let broker = PaperBroker::new(connection.clone(), self.starting_balance)
                .with_min_notional(self.min_notional);
            let broker = if requires_nonce { broker.with_nonce() } else { broker };
            for (symbol, price) in &self.marks {
                broker.set_mark(symbol, *price);
            }
            Arc::new(broker)
        });
        Arc::clone(broker)
    }
}

impl BrokerFactory for PaperBrokerFactory {
    fn connect(&self, connection: &Arc<ExchangeConnection>) -> Result<SharedBroker, ConfigError> {
        let broker = self.prepare(&connection.id, connection.requires_nonce.unwrap_or(false));
        Ok(broker as SharedBroker)
    }
}
