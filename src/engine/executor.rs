//! # engine::executor
//!
//! **Connection Gateway**: the only path from the orchestrator to a broker.
//!
//! Every call is bounded by a timeout and its outcome feeds the connection's
//! circuit breaker. Orders on nonce-requiring exchanges take a ticket from
//! the [`NonceSequencer`] and hold it until the exchange answers, so a
//! serialized lane sends one request at a time.
//!
//! A timed-out order is never retried here: the order may or may not have
//! reached the exchange, and the next cycle re-fetches positions instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::SharedBroker;
use crate::error::BrokerError;
use crate::models::{ConnectionId, ExchangeConnection, OrderRequest, OrderResult, Position};
use crate::nonce::NonceSequencer;
use crate::safety::SafetyController;

/// Fresh nonces issued after a rejection before the order is given up on.
const NONCE_REISSUES: u32 = 1;

pub struct ConnectionGateway {
    connection: Arc<ExchangeConnection>,
    broker: SharedBroker,
    nonces: Arc<NonceSequencer>,
    safety: Arc<SafetyController>,
    timeout: Duration,
    requires_nonce: bool,
}

impl ConnectionGateway {
    pub fn new(
        connection: Arc<ExchangeConnection>,
        broker: SharedBroker,
        nonces: Arc<NonceSequencer>,
        safety: Arc<SafetyController>,
        timeout: Duration,
    ) -> Self {
        let requires_nonce = connection
            .requires_nonce
            .unwrap_or_else(|| broker.requires_nonce());
        if requires_nonce {
            debug!(
                connection = %connection.id,
                serialized = nonces.is_serialized(connection.exchange()),
                "nonce lane bound"
            );
        }
        Self {
            connection,
            broker,
            nonces,
            safety,
            timeout,
            requires_nonce,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.connection.id
    }

    pub fn min_notional(&self, symbol: &str) -> f64 {
        self.broker.min_notional(symbol)
    }

    /// Bound `call` by the gateway timeout and report the outcome to the
    /// connection's breaker.
    async fn guarded<T, F>(&self, op: &'static str, call: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout),
        };
        match &result {
            Ok(_) => self.safety.record_success(self.id()),
            Err(e) => {
                warn!(connection = %self.id(), op, error = %e, "broker call failed");
                self.safety.record_failure(self.id(), e);
            }
        }
        result
    }

    pub async fn balance(&self) -> Result<f64, BrokerError> {
        let account = self.connection.account();
        self.guarded("get_balance", self.broker.get_balance(account)).await
    }

    pub async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let account = self.connection.account();
        self.guarded("get_positions", self.broker.get_positions(account)).await
    }

    /// Place an order. On a nonce rejection the conflict is recorded (which
    /// may escalate the lane to full serialization) and the order is re-sent
    /// once with a fresh nonce.
    pub async fn submit(&self, order: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let account = self.connection.account();
        let exchange = self.connection.exchange();
        let mut reissues = 0;

        loop {
            let mut request = order.clone();
            let ticket = if self.requires_nonce {
                Some(self.nonces.begin_request(exchange).await)
            } else {
                None
            };
            request.nonce = ticket.as_ref().map(|t| t.nonce);

            let result = self
                .guarded("place_order", self.broker.place_order(account, &request))
                .await;
            // Response received: the next request on this lane may go.
            drop(ticket);

            match result {
                Err(BrokerError::InvalidNonce) if self.requires_nonce => {
                    self.nonces.record_conflict(exchange);
                    if reissues >= NONCE_REISSUES {
                        return Err(BrokerError::InvalidNonce);
                    }
                    reissues += 1;
                }
                Ok(ack) => {
                    if self.requires_nonce {
                        self.nonces.record_accepted(exchange);
                    }
                    info!(
                        connection = %self.id(),
                        symbol = %request.symbol,
                        side = ?request.side,
                        quantity = request.quantity,
                        reduce_only = request.reduce_only,
                        nonce = ?request.nonce,
                        order_id = %ack.order_id,
                        "✅ order accepted"
                    );
                    return Ok(ack);
                }
                Err(BrokerError::Timeout) => {
                    self.cancel_unconfirmed(&request).await;
                    return Err(BrokerError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A timed-out order may still be resting on the exchange. Best effort:
    /// the outcome is logged, never retried.
    async fn cancel_unconfirmed(&self, request: &OrderRequest) {
        let order_id = request.client_order_id.to_string();
        let cancel = self.broker.cancel_order(self.connection.account(), &order_id);
        match tokio::time::timeout(self.timeout, cancel).await {
            Ok(Ok(())) => info!(connection = %self.id(), %order_id, "cancelled order after timeout"),
            Ok(Err(e)) => warn!(connection = %self.id(), %order_id, error = %e, "cancel after timeout failed"),
            Err(_) => warn!(connection = %self.id(), %order_id, "cancel after timeout also timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::models::Side;
    use crate::nonce::{MemoryNonceStore, NonceConfig};
    use crate::registry::tests::account_with;
    use crate::safety::{BreakerState, SafetyConfig};

    fn setup(broker: PaperBroker) -> (ConnectionGateway, Arc<PaperBroker>, Arc<NonceSequencer>, Arc<SafetyController>) {
        let account = account_with("a", &["kraken"]);
        let safety = Arc::new(SafetyController::new(SafetyConfig::default()));
        safety.register_account(&account);
        let nonces = Arc::new(NonceSequencer::new(
            Arc::new(MemoryNonceStore::default()),
            NonceConfig { conflict_escalation: 2, ..NonceConfig::default() },
        ));
        let broker = Arc::new(broker);
        broker.set_mark("BTC", 100.0);
        let gateway = ConnectionGateway::new(
            Arc::clone(&account.connections[0]),
            broker.clone(),
            Arc::clone(&nonces),
            Arc::clone(&safety),
            Duration::from_secs(1),
        );
        (gateway, broker, nonces, safety)
    }

    fn paper() -> PaperBroker {
        let account = account_with("a", &["kraken"]);
        PaperBroker::new(account.connections[0].id.clone(), 1_000.0)
    }

    #[tokio::test]
    async fn test_submit_attaches_nonce_when_required() {
        let (gateway, broker, _, _) = setup(paper().with_nonce());
        gateway
            .submit(&OrderRequest::open("BTC", Side::Buy, 1.0))
            .await
            .expect("accepted");
        let filled = broker.filled_orders();
        assert!(filled[0].nonce.is_some());
    }

    #[tokio::test]
    async fn test_nonce_rejection_reissues_once_and_escalates() {
        let (gateway, broker, nonces, _) = setup(paper().with_nonce());
        broker.fail_next(1, BrokerError::InvalidNonce);
        gateway
            .submit(&OrderRequest::open("BTC", Side::Buy, 1.0))
            .await
            .expect("second nonce accepted");

        broker.fail_next(2, BrokerError::InvalidNonce);
        let err = gateway
            .submit(&OrderRequest::open("BTC", Side::Buy, 1.0))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::InvalidNonce);
        assert!(nonces.is_serialized(&gateway.id().exchange));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_against_breaker() {
        let (gateway, broker, _, safety) = setup(paper());
        broker.set_latency(Some(Duration::from_secs(5)));
        for _ in 0..3 {
            assert_eq!(gateway.balance().await, Err(BrokerError::Timeout));
        }
        assert_eq!(safety.breaker_state(gateway.id()), Some(BreakerState::Open));
    }

    #[tokio::test]
    async fn test_timed_out_order_is_cancelled() {
        let (gateway, broker, _, _) = setup(paper());
        broker.fail_next(1, BrokerError::Timeout);
        let order = OrderRequest::open("BTC", Side::Buy, 1.0);
        assert_eq!(gateway.submit(&order).await, Err(BrokerError::Timeout));
        assert_eq!(broker.cancelled(), vec![order.client_order_id.to_string()]);
        assert!(broker.filled_orders().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_leaves_breaker_closed() {
        let (gateway, _, _, safety) = setup(paper());
        for _ in 0..5 {
            let err = gateway
                .submit(&OrderRequest::open("DOGE", Side::Buy, 1.0))
                .await
                .unwrap_err();
            assert!(matches!(err, BrokerError::Rejected(_)));
        }
        assert_eq!(safety.breaker_state(gateway.id()), Some(BreakerState::Closed));
    }
}
