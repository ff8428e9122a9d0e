//! # scheduler: TradingLoopScheduler
//!
//! Supervisor for one long-lived worker task per (account, connection).
//!
//! ```text
//!  Starting ──▶ Running ⇄ Paused ──▶ Stopped
//!                  │
//!                  └──────────────▶ Failed
//! ```
//!
//! Workers are started with a staggered delay, own their backoff, and never
//! share failure state: a panic, timeout or rate-limit storm in one worker
//! leaves every other worker untouched. Accounts can be added and removed at
//! runtime; stop requests are honoured at cycle boundaries, so an in-flight
//! order is never interrupted.

mod backoff;
mod desk;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::BrokerFactory;
use crate::config::{env_millis, env_or, env_secs};
use crate::decision::DecisionEngine;
use crate::engine::{ConnectionGateway, PositionCapEnforcer, UnwindLedger, UnwindRecord};
use crate::error::ConfigError;
use crate::models::{Account, AccountId, ConnectionId, ExchangeId};
use crate::nonce::NonceSequencer;
use crate::safety::SafetyController;

use desk::AccountDesk;
use worker::Worker;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cycle_interval: Duration,
    /// Start delay between consecutive workers.
    pub stagger: Duration,
    /// Upper bound on every broker call.
    pub broker_timeout: Duration,
    /// Consecutive transient failures tolerated before a worker fails.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,
    /// Consecutive fatal broker errors before a worker fails.
    pub max_fatal_errors: u32,
    /// How long shutdown waits for a worker to reach a cycle boundary.
    pub shutdown_grace: Duration,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            cycle_interval: env_secs("CYCLE_INTERVAL_SECS", 30),
            stagger: env_millis("STAGGER_MS", 500),
            broker_timeout: env_secs("BROKER_TIMEOUT_SECS", 10),
            max_retries: env_or("MAX_RETRIES", 5),
            backoff_base: env_millis("BACKOFF_BASE_MS", 1_000),
            backoff_max: env_secs("BACKOFF_MAX_SECS", 60),
            backoff_jitter: env_or("BACKOFF_JITTER", 0.1),
            max_fatal_errors: env_or("MAX_FATAL_ERRORS", 3),
            shutdown_grace: env_secs("SHUTDOWN_GRACE_SECS", 30),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(30),
            stagger: Duration::from_millis(500),
            broker_timeout: Duration::from_secs(10),
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.1,
            max_fatal_errors: 3,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

// ─── Loop State ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Paused,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradingLoopStatus {
    pub connection: ConnectionId,
    pub state: LoopState,
    pub paused_reason: Option<String>,
    pub cycles: u64,
    pub orders_placed: u64,
    pub consecutive_errors: u32,
    pub consecutive_fatal: u32,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl TradingLoopStatus {
    fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            state: LoopState::Starting,
            paused_reason: None,
            cycles: 0,
            orders_placed: 0,
            consecutive_errors: 0,
            consecutive_fatal: 0,
            last_error: None,
            last_cycle_at: None,
        }
    }
}

struct WorkerHandle {
    status: Arc<RwLock<TradingLoopStatus>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

pub struct TradingLoopScheduler {
    config: SchedulerConfig,
    safety: Arc<SafetyController>,
    nonces: Arc<NonceSequencer>,
    brokers: Arc<dyn BrokerFactory>,
    engine: Arc<dyn DecisionEngine>,
    enforcer: Arc<PositionCapEnforcer>,
    workers: Mutex<HashMap<ConnectionId, WorkerHandle>>,
    desks: Mutex<HashMap<AccountId, Arc<AccountDesk>>>,
    /// Unwind progress loaded from the snapshot, handed to each account's
    /// desk when it is added.
    restored: Mutex<HashMap<AccountId, Vec<UnwindRecord>>>,
    snapshot_due: Arc<Notify>,
}

impl TradingLoopScheduler {
    pub fn new(
        config: SchedulerConfig,
        safety: Arc<SafetyController>,
        nonces: Arc<NonceSequencer>,
        brokers: Arc<dyn BrokerFactory>,
        engine: Arc<dyn DecisionEngine>,
        enforcer: PositionCapEnforcer,
    ) -> Self {
        Self {
            config,
            safety,
            nonces,
            brokers,
            engine,
            enforcer: Arc::new(enforcer),
            workers: Mutex::new(HashMap::new()),
            desks: Mutex::new(HashMap::new()),
            restored: Mutex::new(HashMap::new()),
            snapshot_due: Arc::new(Notify::new()),
        }
    }

    /// Fires whenever enforcement changed positions or the unwind ledger.
    pub fn snapshot_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.snapshot_due)
    }

    /// Seed unwind progress for accounts that have not been added yet.
    pub fn restore_unwinds(&self, records: Vec<UnwindRecord>) {
        let mut restored = self.restored.lock();
        for record in records {
            restored
                .entry(record.key.connection.account.clone())
                .or_default()
                .push(record);
        }
    }

    /// Bind brokers for every connection of `account` and start its workers.
    /// Nothing is spawned if any connection fails to bind. Adding an account
    /// that is already running is a no-op.
    pub fn add_account(&self, account: Arc<Account>) -> Result<(), ConfigError> {
        if self.desks.lock().contains_key(&account.id) {
            info!(account = %account.id, "account already scheduled");
            return Ok(());
        }

        let mut gateways = Vec::with_capacity(account.connections.len());
        for connection in &account.connections {
            let broker = self.brokers.connect(connection)?;
            gateways.push(Arc::new(ConnectionGateway::new(
                Arc::clone(connection),
                broker,
                Arc::clone(&self.nonces),
                Arc::clone(&self.safety),
                self.config.broker_timeout,
            )));
        }

        self.safety.register_account(&account);
        let ledger = UnwindLedger::from_records(
            self.restored.lock().remove(&account.id).unwrap_or_default(),
        );
        let desk = Arc::new(AccountDesk::new(Arc::clone(&account), gateways.clone(), ledger));
        self.desks.lock().insert(account.id.clone(), Arc::clone(&desk));

        if !account.enabled {
            info!(account = %account.id, "account disabled, workers not started");
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for gateway in gateways {
            let delay = self
                .config
                .stagger
                .saturating_mul(workers.len() as u32)
                .min(self.config.cycle_interval);
            let status = Arc::new(RwLock::new(TradingLoopStatus::new(gateway.id().clone())));
            let (stop_tx, stop_rx) = watch::channel(false);
            let id = gateway.id().clone();

            let worker = Worker {
                gateway,
                desk: Arc::clone(&desk),
                safety: Arc::clone(&self.safety),
                engine: Arc::clone(&self.engine),
                enforcer: Arc::clone(&self.enforcer),
                config: self.config.clone(),
                status: Arc::clone(&status),
                stop: stop_rx,
                snapshot_due: Arc::clone(&self.snapshot_due),
            };
            let task = tokio::spawn(worker.run(delay));
            info!(connection = %id, delay_ms = delay.as_millis() as u64, "🚀 trading loop spawned");
            workers.insert(
                id,
                WorkerHandle {
                    status,
                    stop: stop_tx,
                    task,
                },
            );
        }
        Ok(())
    }

    /// Stop the account's workers at their next cycle boundary and forget it.
    pub async fn remove_account(&self, account: &AccountId) -> bool {
        let desk = self.desks.lock().remove(account);
        let handles: Vec<(ConnectionId, WorkerHandle)> = {
            let mut workers = self.workers.lock();
            let ids: Vec<ConnectionId> = workers
                .keys()
                .filter(|id| &id.account == account)
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| workers.remove(&id).map(|h| (id, h)))
                .collect()
        };
        self.stop_all(handles).await;
        self.safety.unregister_account(account);
        if desk.is_some() {
            info!(%account, "account removed from schedule");
        }
        desk.is_some()
    }

    /// Stop every worker and wait (up to the grace period) for each to finish
    /// its current cycle.
    pub async fn shutdown(&self) {
        let handles: Vec<(ConnectionId, WorkerHandle)> = self.workers.lock().drain().collect();
        info!(workers = handles.len(), "stopping trading loops");
        self.stop_all(handles).await;
    }

    async fn stop_all(&self, handles: Vec<(ConnectionId, WorkerHandle)>) {
        for (_, handle) in &handles {
            // Err: the worker already exited.
            let _ = handle.stop.send(true);
        }
        for (id, handle) in handles {
            let abort = handle.task.abort_handle();
            match tokio::time::timeout(self.config.shutdown_grace, handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(connection = %id, error = %e, "worker task ended abnormally"),
                Err(_) => {
                    warn!(connection = %id, "worker did not stop within grace period, aborting");
                    abort.abort();
                    handle.status.write().state = LoopState::Stopped;
                }
            }
        }
    }

    pub fn loop_state(&self, account: &AccountId, exchange: &ExchangeId) -> Option<LoopState> {
        let id = ConnectionId::new(account.clone(), exchange.clone());
        self.workers.lock().get(&id).map(|h| h.status.read().state)
    }

    pub fn loop_status(&self, account: &AccountId, exchange: &ExchangeId) -> Option<TradingLoopStatus> {
        let id = ConnectionId::new(account.clone(), exchange.clone());
        self.workers.lock().get(&id).map(|h| h.status.read().clone())
    }

    pub fn loop_statuses(&self) -> Vec<TradingLoopStatus> {
        let mut statuses: Vec<TradingLoopStatus> = self
            .workers
            .lock()
            .values()
            .map(|h| h.status.read().clone())
            .collect();
        statuses.sort_by(|a, b| a.connection.cmp(&b.connection));
        statuses
    }

    /// Unwind progress of every scheduled account, for the state snapshot.
    pub async fn unwind_records(&self) -> Vec<UnwindRecord> {
        let desks: Vec<Arc<AccountDesk>> = self.desks.lock().values().cloned().collect();
        let mut records = Vec::new();
        for desk in desks {
            records.extend(desk.unwind_records().await);
        }
        records.extend(self.restored.lock().values().flatten().cloned());
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::{PaperBroker, PaperBrokerFactory};
    use crate::broker::BrokerCapability;
    use crate::engine::EnforcerConfig;
    use crate::error::BrokerError;
    use crate::models::{Action, MarketSnapshot, Position, Side};
    use crate::nonce::{MemoryNonceStore, NonceConfig};
    use crate::registry::tests::account_with;
    use crate::safety::SafetyConfig;

    /// Buys one BTC every cycle; panics for accounts listed in `panic_for`.
    struct Accumulate {
        panic_for: Vec<&'static str>,
    }

    impl DecisionEngine for Accumulate {
        fn evaluate(&self, account: &Account, _: &MarketSnapshot, _: &[Position]) -> Vec<Action> {
            if self.panic_for.contains(&account.id.as_str()) {
                panic!("strategy blew up for {}", account.id);
            }
            vec![Action::Open {
                symbol: "BTC".into(),
                side: Side::Buy,
                quantity: 1.0,
            }]
        }
    }

    struct Harness {
        scheduler: TradingLoopScheduler,
        factory: Arc<PaperBrokerFactory>,
        safety: Arc<SafetyController>,
    }

    fn harness(config: SchedulerConfig, panic_for: Vec<&'static str>) -> Harness {
        let safety = Arc::new(SafetyController::new(SafetyConfig::default()));
        let nonces = Arc::new(NonceSequencer::new(
            Arc::new(MemoryNonceStore::default()),
            NonceConfig::default(),
        ));
        let factory = Arc::new(PaperBrokerFactory::new(10_000.0, 5.0));
        let scheduler = TradingLoopScheduler::new(
            config,
            Arc::clone(&safety),
            nonces,
            factory.clone(),
            Arc::new(Accumulate { panic_for }),
            PositionCapEnforcer::new(EnforcerConfig::default()),
        );
        Harness {
            scheduler,
            factory,
            safety,
        }
    }

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            cycle_interval: Duration::from_secs(10),
            stagger: Duration::from_millis(100),
            broker_timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(4),
            backoff_jitter: 0.0,
            max_fatal_errors: 3,
            shutdown_grace: Duration::from_secs(60),
        }
    }

    impl Harness {
        fn add(&self, id: &str, exchanges: &[&str]) -> Vec<Arc<PaperBroker>> {
            let account = Arc::new(account_with(id, exchanges));
            let brokers = account
                .connections
                .iter()
                .map(|c| {
                    let broker = self.factory.prepare(&c.id, false);
                    broker.set_mark("BTC", 100.0);
                    broker
                })
                .collect();
            self.scheduler.add_account(account).expect("added");
            brokers
        }

        fn state(&self, account: &str, exchange: &str) -> Option<LoopState> {
            self.scheduler
                .loop_state(&AccountId::new(account), &ExchangeId::new(exchange))
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_kill_stops_every_worker_at_next_boundary() {
        let h = harness(fast(), vec![]);
        let a = h.add("a", &["kraken"]);
        let b = h.add("b", &["kraken", "bitstamp"]);
        advance(25).await;
        assert!(a[0].filled_orders().len() >= 2);
        assert_eq!(h.state("b", "bitstamp"), Some(LoopState::Running));

        h.safety.engage_global("drill");
        assert!(!h.safety.can_trade(&AccountId::new("a")));
        assert!(!h.safety.can_trade(&AccountId::new("b")));

        // Let every worker pass a cycle boundary, then freeze the counts.
        advance(11).await;
        let frozen: Vec<usize> = a.iter().chain(&b).map(|br| br.filled_orders().len()).collect();
        advance(60).await;
        let after: Vec<usize> = a.iter().chain(&b).map(|br| br.filled_orders().len()).collect();
        assert_eq!(frozen, after);
        assert_eq!(h.state("a", "kraken"), Some(LoopState::Paused));

        h.safety.release_global();
        advance(11).await;
        assert_eq!(h.state("a", "kraken"), Some(LoopState::Running));
        assert!(a[0].filled_orders().len() > after[0]);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_fatal_errors_fail_only_that_worker() {
        let h = harness(fast(), vec![]);
        let good = h.add("good", &["kraken"]);
        let bad = h.add("bad", &["kraken"]);
        bad[0].fail_next(100, BrokerError::InvalidCredentials);

        advance(35).await;
        assert_eq!(h.state("bad", "kraken"), Some(LoopState::Failed));
        let calls = bad[0].calls();
        assert_eq!(calls, 3);

        let placed = good[0].filled_orders().len();
        advance(60).await;
        assert_eq!(bad[0].calls(), calls, "failed worker makes no further calls");
        assert_eq!(h.state("good", "kraken"), Some(LoopState::Running));
        assert!(good[0].filled_orders().len() > placed);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_strategy_is_isolated() {
        let h = harness(fast(), vec!["boom"]);
        let calm = h.add("calm", &["kraken"]);
        let _ = h.add("boom", &["kraken"]);

        advance(60).await;
        assert_eq!(h.state("boom", "kraken"), Some(LoopState::Failed));
        let status = h
            .scheduler
            .loop_status(&AccountId::new("boom"), &ExchangeId::new("kraken"))
            .expect("status");
        assert!(status.last_error.unwrap_or_default().contains("panicked"));
        assert_eq!(h.state("calm", "kraken"), Some(LoopState::Running));
        assert!(calm[0].filled_orders().len() >= 5);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_cycle_is_followed_immediately() {
        let h = harness(fast(), vec![]);
        let brokers = h.add("slow", &["kraken"]);
        advance(1).await;
        // From cycle 1 (t=10) on, balance + positions + order take 24s.
        brokers[0].set_latency(Some(Duration::from_secs(8)));
        // Cycle 1 ends at t=34; the next starts then, not at t=40.
        advance(36).await;
        let status = h
            .scheduler
            .loop_status(&AccountId::new("slow"), &ExchangeId::new("kraken"))
            .expect("status");
        assert_eq!(status.cycles, 3);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_kill_pauses_only_that_account() {
        let h = harness(fast(), vec![]);
        let x = h.add("x", &["kraken"]);
        let y = h.add("y", &["kraken"]);
        advance(5).await;

        h.safety.engage_account(&AccountId::new("x"), "manual");
        advance(11).await;
        let frozen = x[0].filled_orders().len();
        let y_before = y[0].filled_orders().len();
        advance(30).await;
        assert_eq!(x[0].filled_orders().len(), frozen);
        assert!(y[0].filled_orders().len() > y_before);
        assert_eq!(h.state("x", "kraken"), Some(LoopState::Paused));
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_and_remove_at_runtime() {
        let h = harness(fast(), vec![]);
        h.add("keep", &["kraken"]);
        advance(5).await;
        let late = h.add("late", &["kraken", "bitstamp"]);
        advance(15).await;
        assert_eq!(h.state("late", "bitstamp"), Some(LoopState::Running));
        assert!(!late[1].filled_orders().is_empty());

        assert!(h.scheduler.remove_account(&AccountId::new("late")).await);
        assert_eq!(h.state("late", "kraken"), None);
        assert!(!h.safety.can_trade(&AccountId::new("late")));
        let frozen = late[0].calls();
        advance(30).await;
        assert_eq!(late[0].calls(), frozen);
        assert_eq!(h.state("keep", "kraken"), Some(LoopState::Running));
        assert_eq!(h.scheduler.loop_statuses().len(), 1);

        assert!(!h.scheduler.remove_account(&AccountId::new("late")).await);
        h.scheduler.shutdown().await;
        assert!(h.scheduler.loop_statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_balance_observes_without_trading() {
        let h = harness(fast(), vec![]);
        let a = h.add("a", &["kraken"]);
        advance(25).await;
        assert!(!a[0].filled_orders().is_empty());

        a[0].set_balance(5.0);
        advance(11).await;
        let frozen = a[0].filled_orders().len();
        advance(30).await;
        assert_eq!(a[0].filled_orders().len(), frozen);
        assert_eq!(h.state("a", "kraken"), Some(LoopState::Running));
        assert!(!h.safety.can_trade(&AccountId::new("a")));

        a[0].set_balance(10_000.0);
        advance(21).await;
        assert!(a[0].filled_orders().len() > frozen);
        assert!(h.safety.can_trade(&AccountId::new("a")));
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_enforced_while_sibling_connection_failed() {
        let h = harness(fast(), vec![]);
        let mix = h.add("mix", &["kraken", "bitstamp"]);
        mix[0].fail_next(1_000, BrokerError::InvalidCredentials);
        for i in 0..12 {
            mix[1].seed_position(
                &format!("S{i:02}"),
                Side::Buy,
                1.0,
                500.0 + 100.0 * i as f64,
                chrono::Duration::minutes(30),
            );
        }

        advance(3_600).await;
        assert_eq!(h.state("mix", "kraken"), Some(LoopState::Failed));
        assert_eq!(h.state("mix", "bitstamp"), Some(LoopState::Running));
        let open = mix[1]
            .get_positions(&AccountId::new("mix"))
            .await
            .expect("positions");
        assert_eq!(open.len(), 8);
        let mut symbols: Vec<String> = open.into_iter().map(|p| p.symbol).collect();
        symbols.sort();
        assert_eq!(symbols.first().map(String::as_str), Some("S04"));
        h.scheduler.shutdown().await;
    }
}
