//! # safety: SafetyController
//!
//! The authoritative trade gate. Combines, in order:
//!
//! 1. **Global kill switch**:   engaged by the emergency-stop sentinel or a
//!    control call; blocks every account.
//! 2. **Account kill switch**:  per account, from the accounts file or a
//!    control call.
//! 3. **Circuit breaker**:      per connection, fed by broker call outcomes.
//! 4. **Minimum balance**:      per connection, from the last observed balance.
//!
//! Every transition becomes a [`SafetyEvent`]: logged, appended to the audit
//! trail, and broadcast. Events are collected while the state lock is held
//! and emitted after it is released; no I/O happens under the lock.

pub mod breaker;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{env_or, env_secs};
use crate::error::{BrokerError, SafetyViolation};
use crate::events::{AuditEntry, SafetyEvent};
use crate::models::{Account, AccountId, ConnectionId};
use crate::scheduler::LoopState;

pub use breaker::{BreakerConfig, BreakerState, BreakerTransition, CircuitBreaker};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Default minimum balance per connection, in quote currency.
    pub min_balance: f64,
    pub breaker: BreakerConfig,
    /// Marker file whose presence halts all trading.
    pub sentinel_path: Option<PathBuf>,
    /// Distinct fatally-failed workers before a process-wide alert (0 = off).
    pub fatal_escalation_threshold: usize,
    /// Audit entries kept in memory.
    pub audit_capacity: usize,
}

impl SafetyConfig {
    pub fn from_env() -> Self {
        Self {
            min_balance: env_or("MIN_BALANCE", 10.0),
            breaker: BreakerConfig {
                failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", 3),
                cooldown: env_secs("BREAKER_COOLDOWN_SECS", 60),
            },
            sentinel_path: Some(
                std::env::var("EMERGENCY_STOP_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("EMERGENCY_STOP")),
            ),
            fatal_escalation_threshold: env_or("FATAL_ESCALATION_THRESHOLD", 3),
            audit_capacity: env_or("AUDIT_CAPACITY", 1024),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_balance: 10.0,
            breaker: BreakerConfig::default(),
            sentinel_path: None,
            fatal_escalation_threshold: 3,
            audit_capacity: 1024,
        }
    }
}

// ─── Gate ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSource {
    Sentinel,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    GlobalKill,
    AccountKill,
    BreakerOpen,
    BalanceBelowMinimum,
    UnknownConnection,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BlockReason::GlobalKill => "global kill switch engaged",
            BlockReason::AccountKill => "account kill switch engaged",
            BlockReason::BreakerOpen => "circuit breaker open",
            BlockReason::BalanceBelowMinimum => "balance below minimum",
            BlockReason::UnknownConnection => "connection not registered",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Blocked(BlockReason),
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }
}

// ─── Internal State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct KillRecord {
    pub source: KillSource,
    pub reason: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug)]
struct AccountGate {
    kill: Option<KillRecord>,
    min_balance: f64,
    connections: Vec<ConnectionId>,
}

#[derive(Debug)]
struct ConnectionHealth {
    breaker: CircuitBreaker,
    balance: Option<f64>,
    min_balance: f64,
}

impl ConnectionHealth {
    fn balance_ok(&self) -> bool {
        self.balance.map_or(true, |b| b >= self.min_balance)
    }
}

#[derive(Debug, Default)]
struct SafetyInner {
    global: Option<KillRecord>,
    accounts: HashMap<AccountId, AccountGate>,
    connections: HashMap<ConnectionId, ConnectionHealth>,
    failed_fatal: BTreeSet<ConnectionId>,
    escalated: bool,
}

// ─── Status (for the health surface) ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connection: ConnectionId,
    pub breaker: BreakerState,
    pub consecutive_errors: u32,
    pub balance: Option<f64>,
    pub min_balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub account: AccountId,
    pub can_trade: bool,
    pub kill: Option<KillRecord>,
    pub connections: Vec<ConnectionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyStatus {
    pub global_kill: Option<KillRecord>,
    pub accounts: Vec<AccountStatus>,
    pub failed_fatal: Vec<ConnectionId>,
}

// ─── Controller ───────────────────────────────────────────────────────────────

pub struct SafetyController {
    inner: RwLock<SafetyInner>,
    audit: Mutex<VecDeque<AuditEntry>>,
    events: broadcast::Sender<SafetyEvent>,
    config: SafetyConfig,
}

impl SafetyController {
    pub fn new(config: SafetyConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(SafetyInner::default()),
            audit: Mutex::new(VecDeque::with_capacity(config.audit_capacity.min(4096))),
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    // ─── Emission ────────────────────────────────────────────────────────────

    fn emit(&self, events: Vec<SafetyEvent>) {
        if events.is_empty() {
            return;
        }
        let now = Utc::now();
        {
            let mut audit = self.audit.lock();
            for event in &events {
                if audit.len() >= self.config.audit_capacity.max(1) {
                    audit.pop_front();
                }
                audit.push_back(AuditEntry {
                    at: now,
                    event: event.clone(),
                });
            }
        }
        for event in events {
            if event.is_alert() {
                error!(at = %now, audit = %event.to_json(), "🚨 safety alert");
            } else {
                info!(at = %now, audit = %event.to_json(), "safety transition");
            }
            // Err only means nobody is subscribed.
            let _ = self.events.send(event);
        }
    }

    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.lock().iter().cloned().collect()
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Track an account and give each of its connections a fresh breaker.
    pub fn register_account(&self, account: &Account) {
        let min_balance = account.min_balance.unwrap_or(self.config.min_balance);
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write();
            let kill = account.kill_switch.then(|| KillRecord {
                source: KillSource::Control,
                reason: "kill switch set in accounts file".to_string(),
                since: Utc::now(),
            });
            if let Some(record) = &kill {
                events.push(SafetyEvent::AccountKillEngaged {
                    account: account.id.clone(),
                    reason: record.reason.clone(),
                });
            }
            let connections = account.connection_ids();
            for id in &connections {
                inner.connections.insert(
                    id.clone(),
                    ConnectionHealth {
                        breaker: CircuitBreaker::new(self.config.breaker.clone()),
                        balance: None,
                        min_balance,
                    },
                );
                inner.failed_fatal.remove(id);
            }
            inner.accounts.insert(
                account.id.clone(),
                AccountGate {
                    kill,
                    min_balance,
                    connections,
                },
            );
        }
        self.emit(events);
    }

    pub fn unregister_account(&self, account: &AccountId) {
        let mut inner = self.inner.write();
        if let Some(gate) = inner.accounts.remove(account) {
            for id in gate.connections {
                inner.connections.remove(&id);
                inner.failed_fatal.remove(&id);
            }
        }
    }

    // ─── Global Kill Switch ──────────────────────────────────────────────────

    pub fn engage_global(&self, reason: &str) {
        self.set_global(KillSource::Control, reason);
    }

    /// Release the switch regardless of who engaged it. A sentinel that is
    /// still present re-engages it on the next poll.
    pub fn release_global(&self) {
        let released = self.inner.write().global.take();
        if let Some(record) = released {
            self.emit(vec![SafetyEvent::GlobalKillReleased {
                source: record.source,
            }]);
        }
    }

    fn set_global(&self, source: KillSource, reason: &str) {
        let engaged = {
            let mut inner = self.inner.write();
            if inner.global.is_some() {
                false
            } else {
                inner.global = Some(KillRecord {
                    source,
                    reason: reason.to_string(),
                    since: Utc::now(),
                });
                true
            }
        };
        if engaged {
            warn!(?source, reason, "⛔ GLOBAL KILL SWITCH ENGAGED");
            self.emit(vec![SafetyEvent::GlobalKillEngaged {
                source,
                reason: reason.to_string(),
            }]);
        }
    }

    /// Level-triggered check of the emergency-stop marker. Present engages
    /// the global switch; absent releases it only if the sentinel engaged it.
    /// Returns whether the global switch is engaged afterwards.
    pub fn poll_sentinel(&self) -> bool {
        let Some(path) = &self.config.sentinel_path else {
            return self.is_globally_halted();
        };
        let present = path.exists();

        if present {
            self.set_global(
                KillSource::Sentinel,
                &format!("emergency stop marker present at {}", path.display()),
            );
        } else {
            let released = {
                let mut inner = self.inner.write();
                match &inner.global {
                    Some(record) if record.source == KillSource::Sentinel => inner.global.take(),
                    _ => None,
                }
            };
            if released.is_some() {
                info!("✅ emergency stop marker removed, global kill released");
                self.emit(vec![SafetyEvent::GlobalKillReleased {
                    source: KillSource::Sentinel,
                }]);
            }
        }
        self.is_globally_halted()
    }

    pub fn is_globally_halted(&self) -> bool {
        self.inner.read().global.is_some()
    }

    // ─── Account Kill Switch ─────────────────────────────────────────────────

    /// Returns `false` for an unknown account.
    pub fn engage_account(&self, account: &AccountId, reason: &str) -> bool {
        let engaged = {
            let mut inner = self.inner.write();
            match inner.accounts.get_mut(account) {
                Some(gate) if gate.kill.is_none() => {
                    gate.kill = Some(KillRecord {
                        source: KillSource::Control,
                        reason: reason.to_string(),
                        since: Utc::now(),
                    });
                    Some(true)
                }
                Some(_) => Some(false),
                None => None,
            }
        };
        match engaged {
            Some(true) => {
                warn!(%account, reason, "⛔ account kill switch engaged");
                self.emit(vec![SafetyEvent::AccountKillEngaged {
                    account: account.clone(),
                    reason: reason.to_string(),
                }]);
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Returns `false` for an unknown account.
    pub fn release_account(&self, account: &AccountId) -> bool {
        let released = {
            let mut inner = self.inner.write();
            match inner.accounts.get_mut(account) {
                Some(gate) => Some(gate.kill.take().is_some()),
                None => None,
            }
        };
        match released {
            Some(true) => {
                self.emit(vec![SafetyEvent::AccountKillReleased {
                    account: account.clone(),
                }]);
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    pub fn killed_accounts(&self) -> Vec<(AccountId, String)> {
        let inner = self.inner.read();
        let mut killed: Vec<_> = inner
            .accounts
            .iter()
            .filter_map(|(id, gate)| gate.kill.as_ref().map(|k| (id.clone(), k.reason.clone())))
            .collect();
        killed.sort();
        killed
    }

    // ─── Gates ───────────────────────────────────────────────────────────────

    /// Gate for one worker. Advances an expired open breaker to half-open so
    /// the coming cycle acts as the trial call.
    pub fn gate_on(&self, connection: &ConnectionId) -> Gate {
        let mut events = Vec::new();
        let gate = {
            let mut inner = self.inner.write();
            let account_killed = inner
                .accounts
                .get(&connection.account)
                .map(|gate| gate.kill.is_some());
            if inner.global.is_some() {
                Gate::Blocked(BlockReason::GlobalKill)
            } else if account_killed == Some(true) {
                Gate::Blocked(BlockReason::AccountKill)
            } else if account_killed.is_none() {
                Gate::Blocked(BlockReason::UnknownConnection)
            } else {
                match inner.connections.get_mut(connection) {
                    None => Gate::Blocked(BlockReason::UnknownConnection),
                    Some(health) => {
                        let (allowed, transition) = health.breaker.allows(Instant::now());
                        if transition == Some(BreakerTransition::HalfOpened) {
                            events.push(SafetyEvent::BreakerHalfOpen {
                                connection: connection.clone(),
                            });
                        }
                        if !allowed {
                            Gate::Blocked(BlockReason::BreakerOpen)
                        } else if !health.balance_ok() {
                            Gate::Blocked(BlockReason::BalanceBelowMinimum)
                        } else {
                            Gate::Open
                        }
                    }
                }
            }
        };
        self.emit(events);
        gate
    }

    pub fn can_trade_on(&self, connection: &ConnectionId) -> bool {
        self.gate_on(connection).is_open()
    }

    /// Account-level health answer: account gates pass and at least one of
    /// its connections is tradable.
    pub fn can_trade(&self, account: &AccountId) -> bool {
        let connections = {
            let inner = self.inner.read();
            if inner.global.is_some() {
                return false;
            }
            match inner.accounts.get(account) {
                Some(gate) if gate.kill.is_none() => gate.connections.clone(),
                _ => return false,
            }
        };
        connections.iter().any(|c| self.can_trade_on(c))
    }

    // ─── Connection Health ───────────────────────────────────────────────────

    pub fn record_success(&self, connection: &ConnectionId) {
        let transition = {
            let mut inner = self.inner.write();
            inner
                .connections
                .get_mut(connection)
                .and_then(|health| health.breaker.record_success())
        };
        if transition == Some(BreakerTransition::Closed) {
            self.emit(vec![SafetyEvent::BreakerClosed {
                connection: connection.clone(),
            }]);
        }
    }

    pub fn record_failure(&self, connection: &ConnectionId, error: &BrokerError) {
        if !error.counts_against_breaker() {
            return;
        }
        let transition = {
            let mut inner = self.inner.write();
            inner
                .connections
                .get_mut(connection)
                .and_then(|health| health.breaker.record_failure(Instant::now()))
        };
        if let Some(BreakerTransition::Opened { consecutive_errors }) = transition {
            warn!(%connection, consecutive_errors, error = %error, "⚡ circuit breaker opened");
            self.emit(vec![SafetyEvent::BreakerOpened {
                connection: connection.clone(),
                consecutive_errors,
                reason: error.to_string(),
            }]);
        }
    }

    pub fn breaker_state(&self, connection: &ConnectionId) -> Option<BreakerState> {
        self.inner
            .read()
            .connections
            .get(connection)
            .map(|h| h.breaker.state())
    }

    pub fn record_balance(&self, connection: &ConnectionId, balance: f64) {
        let event = {
            let mut inner = self.inner.write();
            let Some(health) = inner.connections.get_mut(connection) else {
                return;
            };
            let was_ok = health.balance_ok();
            health.balance = Some(balance);
            match (was_ok, health.balance_ok()) {
                (true, false) => Some(SafetyEvent::BalanceBelowMinimum {
                    connection: connection.clone(),
                    balance,
                    minimum: health.min_balance,
                }),
                (false, true) => Some(SafetyEvent::BalanceRestored {
                    connection: connection.clone(),
                    balance,
                }),
                _ => None,
            }
        };
        self.emit(event.into_iter().collect());
    }

    // ─── Escalations ─────────────────────────────────────────────────────────

    pub fn raise_violation(&self, violation: &SafetyViolation) {
        error!(
            account = %violation.account,
            open = violation.open,
            max = violation.max,
            "🚨 SAFETY VIOLATION: position cap still exceeded after enforcement"
        );
        self.emit(vec![SafetyEvent::SafetyViolation {
            account: violation.account.clone(),
            open: violation.open,
            max: violation.max,
        }]);
    }

    /// A worker failed on a fatal broker error. Once enough distinct workers
    /// have done so the failure is escalated process-wide, once.
    pub fn record_fatal(&self, connection: &ConnectionId) {
        let escalation = {
            let mut inner = self.inner.write();
            inner.failed_fatal.insert(connection.clone());
            let threshold = self.config.fatal_escalation_threshold;
            if threshold > 0 && !inner.escalated && inner.failed_fatal.len() >= threshold {
                inner.escalated = true;
                Some(inner.failed_fatal.iter().cloned().collect::<Vec<_>>())
            } else {
                None
            }
        };
        if let Some(failed) = escalation {
            self.emit(vec![SafetyEvent::FatalEscalation { failed }]);
        }
    }

    pub fn record_loop_transition(
        &self,
        connection: &ConnectionId,
        from: LoopState,
        to: LoopState,
        reason: &str,
    ) {
        self.emit(vec![SafetyEvent::LoopStateChanged {
            connection: connection.clone(),
            from,
            to,
            reason: reason.to_string(),
        }]);
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    pub fn status(&self) -> SafetyStatus {
        let mut ids: Vec<AccountId> = self.inner.read().accounts.keys().cloned().collect();
        ids.sort();
        let tradable: Vec<bool> = ids.iter().map(|id| self.can_trade(id)).collect();

        let inner = self.inner.read();
        let accounts = ids
            .into_iter()
            .zip(tradable)
            .filter_map(|(id, can_trade)| {
                let gate = inner.accounts.get(&id)?;
                let connections = gate
                    .connections
                    .iter()
                    .filter_map(|c| {
                        inner.connections.get(c).map(|h| ConnectionStatus {
                            connection: c.clone(),
                            breaker: h.breaker.state(),
                            consecutive_errors: h.breaker.consecutive_errors(),
                            balance: h.balance,
                            min_balance: h.min_balance,
                        })
                    })
                    .collect();
                Some(AccountStatus {
                    account: id,
                    can_trade,
                    kill: gate.kill.clone(),
                    connections,
                })
            })
            .collect();

        SafetyStatus {
            global_kill: inner.global.clone(),
            accounts,
            failed_fatal: inner.failed_fatal.iter().cloned().collect(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
