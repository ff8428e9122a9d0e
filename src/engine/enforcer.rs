//! # engine::enforcer: PositionCapEnforcer
//!
//! Per-account position policy, aggregated across every connection of the
//! account.
//!
//! ## Pass
//! 1. **Classify** each open position:
//!    * `Dust`:               value < `dust_pct × balance`
//!    * `CapExcess`:          the smallest non-dust positions beyond
//!      `max_positions` (ascending value, ties by earliest `opened_at`)
//!    * `LegacyNonCompliant`: flagged symbol, stale, or already mid-unwind
//!    * `Healthy`:            everything else
//! 2. **Close** Dust and CapExcess in full.
//! 3. **Unwind** LegacyNonCompliant by `unwind_fraction` of the size recorded
//!    at unwind start, one pass per `unwind_interval`, at most `max_passes`
//!    passes. A remainder that would fall under the exchange minimum
//!    notional is closed in full instead.
//! 4. **Verify** by re-fetching: still over the cap is a [`SafetyViolation`].
//!
//! ## Unreachable connections
//! A connection whose loop has failed, or whose breaker is open, is not
//! called. Its last known open count still counts against the cap, so the
//! pass closes enough on the reachable connections to keep the account
//! total at or under `max_positions`, and raises a violation if it cannot.
//!
//! Planning is pure ([`PositionCapEnforcer::plan`]); execution goes through
//! the connection gateways.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{env_list, env_or, env_secs};
use crate::engine::executor::ConnectionGateway;
use crate::error::{BrokerError, SafetyViolation};
use crate::models::{AccountId, ConnectionId, OrderRequest, Position, PositionKey, Side};
use crate::safety::{BreakerState, SafetyController};

const QTY_EPSILON: f64 = 1e-9;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub max_positions: usize,
    /// Fraction of account balance under which a position is dust (0.01 = 1%).
    pub dust_pct: f64,
    pub unwind_fraction: f64,
    pub max_unwind_passes: u32,
    /// Minimum spacing between two unwind passes on the same position.
    pub unwind_interval: Duration,
    /// Symbols that must be wound down (e.g. a high-volatility list).
    pub legacy_symbols: Vec<String>,
    /// Positions older than this are treated as legacy. `None` disables.
    pub stale_after: Option<Duration>,
    /// Run every K worker cycles (plus once at worker start).
    pub every_cycles: u32,
}

impl EnforcerConfig {
    pub fn from_env() -> Self {
        let stale_hours: u64 = env_or("STALE_POSITION_HOURS", 0);
        Self {
            max_positions: env_or("MAX_POSITIONS", 8),
            dust_pct: env_or("DUST_PCT", 0.01),
            unwind_fraction: env_or("UNWIND_FRACTION", 0.25),
            max_unwind_passes: env_or("UNWIND_MAX_PASSES", 4),
            unwind_interval: env_secs("UNWIND_INTERVAL_SECS", 900),
            legacy_symbols: env_list("LEGACY_SYMBOLS"),
            stale_after: (stale_hours > 0).then(|| Duration::from_secs(stale_hours * 3600)),
            every_cycles: env_or("ENFORCE_EVERY_CYCLES", 10),
        }
    }
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            max_positions: 8,
            dust_pct: 0.01,
            unwind_fraction: 0.25,
            max_unwind_passes: 4,
            unwind_interval: Duration::from_secs(900),
            legacy_symbols: Vec::new(),
            stale_after: None,
            every_cycles: 10,
        }
    }
}

// ─── Classification ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionClass {
    Dust,
    CapExcess,
    LegacyNonCompliant,
    Healthy,
}

// ─── Unwind Ledger ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwindProgress {
    /// Size when the unwind started; each pass closes a fraction of this.
    pub initial_quantity: f64,
    pub passes_done: u32,
    pub last_pass_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwindRecord {
    pub key: PositionKey,
    pub progress: UnwindProgress,
}

/// Positions currently mid-unwind. Persisted in the state snapshot so an
/// unwind resumes where it left off after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnwindLedger {
    entries: HashMap<PositionKey, UnwindProgress>,
}

impl UnwindLedger {
    pub fn get(&self, key: &PositionKey) -> Option<&UnwindProgress> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &PositionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn records(&self) -> Vec<UnwindRecord> {
        let mut records: Vec<_> = self
            .entries
            .iter()
            .map(|(key, progress)| UnwindRecord {
                key: key.clone(),
                progress: progress.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn from_records(records: impl IntoIterator<Item = UnwindRecord>) -> Self {
        Self {
            entries: records.into_iter().map(|r| (r.key, r.progress)).collect(),
        }
    }

    /// Forget entries on `fetched` connections whose position no longer
    /// exists. Entries on connections that were not fetched are kept.
    fn prune(&mut self, fetched: &[&ConnectionId], open: &[Position]) {
        self.entries.retain(|key, _| {
            !fetched.contains(&&key.connection) || open.iter().any(|p| &p.key() == key)
        });
    }
}

// ─── Plan ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosePlan {
    pub key: PositionKey,
    /// Side of the closing order (opposite of the position).
    pub side: Side,
    pub quantity: f64,
    pub class: PositionClass,
    /// Closes the whole remaining position.
    pub full: bool,
    /// Unwind pass number (1-based) for legacy positions.
    pub pass: Option<u32>,
    /// Quantity the unwind is measured against, for the ledger.
    #[serde(skip)]
    initial_quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseOutcome {
    pub plan: ClosePlan,
    pub error: Option<String>,
}

impl CloseOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnforcementReport {
    pub account: AccountId,
    /// Total over the reachable connections.
    pub balance: f64,
    /// Includes `stranded_open`.
    pub open_before: usize,
    /// Connections left out of this pass.
    pub unreachable: Vec<ConnectionId>,
    /// Last known open positions on `unreachable` connections.
    pub stranded_open: usize,
    /// `None` when the verification re-fetch failed. Includes `stranded_open`.
    pub open_after: Option<usize>,
    pub closes: Vec<CloseOutcome>,
    pub violation: Option<SafetyViolation>,
}

impl EnforcementReport {
    pub fn closed(&self) -> usize {
        self.closes.iter().filter(|c| c.succeeded()).count()
    }
}

/// What the workers know about an account's connections beyond what a pass
/// fetches itself.
#[derive(Debug, Clone, Default)]
pub struct AccountView {
    /// Connections whose trading loop has failed.
    pub failed: HashSet<ConnectionId>,
    /// Last observed open-position count per connection.
    pub last_open: HashMap<ConnectionId, usize>,
}

/// Why a pass did not run at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnforcementSkipped {
    #[error("no connection of the account is reachable")]
    NoReachableConnection,
    #[error("fetch from {connection} failed: {error}")]
    FetchFailed { connection: String, error: BrokerError },
}

// ─── Enforcer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PositionCapEnforcer {
    config: EnforcerConfig,
}

impl PositionCapEnforcer {
    pub fn new(config: EnforcerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    fn is_flagged(&self, position: &Position, ledger: &UnwindLedger, now: DateTime<Utc>) -> bool {
        let listed = self
            .config
            .legacy_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&position.symbol));
        let stale = self.config.stale_after.is_some_and(|limit| {
            now.signed_duration_since(position.opened_at)
                .to_std()
                .map_or(false, |age| age >= limit)
        });
        listed || stale || ledger.contains(&position.key())
    }

    /// Classify every position, index-aligned with `positions`.
    pub fn classify(
        &self,
        positions: &[Position],
        balance: f64,
        ledger: &UnwindLedger,
        now: DateTime<Utc>,
    ) -> Vec<PositionClass> {
        self.classify_within(positions, balance, ledger, now, self.config.max_positions)
    }

    /// As [`classify`](Self::classify), with `cap` non-dust positions allowed.
    fn classify_within(
        &self,
        positions: &[Position],
        balance: f64,
        ledger: &UnwindLedger,
        now: DateTime<Utc>,
        cap: usize,
    ) -> Vec<PositionClass> {
        let dust_line = self.config.dust_pct * balance;
        let mut classes: Vec<PositionClass> = positions
            .iter()
            .map(|p| {
                if p.value() < dust_line {
                    PositionClass::Dust
                } else {
                    PositionClass::Healthy
                }
            })
            .collect();

        let mut ranked: Vec<usize> = (0..positions.len())
            .filter(|&i| classes[i] != PositionClass::Dust)
            .collect();
        if ranked.len() > cap {
            ranked.sort_by(|&a, &b| {
                positions[a]
                    .value()
                    .total_cmp(&positions[b].value())
                    .then(positions[a].opened_at.cmp(&positions[b].opened_at))
            });
            let excess = ranked.len() - cap;
            for &i in &ranked[..excess] {
                classes[i] = PositionClass::CapExcess;
            }
        }

        for (i, position) in positions.iter().enumerate() {
            if classes[i] == PositionClass::Healthy && self.is_flagged(position, ledger, now) {
                classes[i] = PositionClass::LegacyNonCompliant;
            }
        }
        classes
    }

    /// Closing orders for one pass. Pure: nothing is sent and the ledger is
    /// not touched.
    pub fn plan<F>(
        &self,
        positions: &[Position],
        balance: f64,
        ledger: &UnwindLedger,
        min_notional: F,
        now: DateTime<Utc>,
    ) -> Vec<ClosePlan>
    where
        F: Fn(&Position) -> f64,
    {
        self.plan_within(positions, balance, ledger, &min_notional, now, self.config.max_positions)
    }

    fn plan_within<F>(
        &self,
        positions: &[Position],
        balance: f64,
        ledger: &UnwindLedger,
        min_notional: &F,
        now: DateTime<Utc>,
        cap: usize,
    ) -> Vec<ClosePlan>
    where
        F: Fn(&Position) -> f64,
    {
        let classes = self.classify_within(positions, balance, ledger, now, cap);
        let mut plans = Vec::new();

        for (position, class) in positions.iter().zip(classes) {
            let full_close = |class| ClosePlan {
                key: position.key(),
                side: position.side.opposite(),
                quantity: position.quantity,
                class,
                full: true,
                pass: None,
                initial_quantity: position.quantity,
            };

            match class {
                PositionClass::Healthy => {}
                PositionClass::Dust | PositionClass::CapExcess => plans.push(full_close(class)),
                PositionClass::LegacyNonCompliant => {
                    if let Some(plan) = self.plan_unwind(position, ledger, min_notional, now) {
                        plans.push(plan);
                    }
                }
            }
        }
        plans
    }

    fn plan_unwind<F>(
        &self,
        position: &Position,
        ledger: &UnwindLedger,
        min_notional: &F,
        now: DateTime<Utc>,
    ) -> Option<ClosePlan>
    where
        F: Fn(&Position) -> f64,
    {
        let key = position.key();
        let (initial, passes_done) = match ledger.get(&key) {
            Some(progress) => {
                let since = now.signed_duration_since(progress.last_pass_at);
                let spaced = since
                    .to_std()
                    .map_or(false, |elapsed| elapsed >= self.config.unwind_interval);
                if !spaced {
                    debug!(position = %key, "unwind pass not due yet");
                    return None;
                }
                (progress.initial_quantity, progress.passes_done)
            }
            None => (position.quantity, 0),
        };

        let pass = passes_done + 1;
        let remaining = position.quantity;
        let chunk = (initial * self.config.unwind_fraction).min(remaining);
        let remainder = remaining - chunk;
        let floor = min_notional(position);
        let price = position.price();

        // Closing orders are reduce-only, so only what is left behind has to
        // clear the exchange minimum.
        let full = pass >= self.config.max_unwind_passes
            || remainder <= QTY_EPSILON
            || remainder * price < floor;

        Some(ClosePlan {
            key,
            side: position.side.opposite(),
            quantity: if full { remaining } else { chunk },
            class: PositionClass::LegacyNonCompliant,
            full,
            pass: Some(pass),
            initial_quantity: initial,
        })
    }

    /// One enforcement pass over an account. `gateways` must hold every
    /// connection of the account; failed or breaker-open ones are left out
    /// and counted at their last known open positions.
    pub async fn enforce(
        &self,
        account: &AccountId,
        gateways: &[Arc<ConnectionGateway>],
        view: &AccountView,
        ledger: &mut UnwindLedger,
        safety: &SafetyController,
    ) -> Result<EnforcementReport, EnforcementSkipped> {
        let (reachable, unreachable): (Vec<_>, Vec<_>) = gateways.iter().cloned().partition(|gw| {
            !view.failed.contains(gw.id()) && safety.breaker_state(gw.id()) != Some(BreakerState::Open)
        });
        if reachable.is_empty() {
            return Err(EnforcementSkipped::NoReachableConnection);
        }
        let stranded_open: usize = unreachable
            .iter()
            .map(|gw| view.last_open.get(gw.id()).copied().unwrap_or(0))
            .sum();
        for gw in &unreachable {
            warn!(
                account = %account,
                connection = %gw.id(),
                last_open = view.last_open.get(gw.id()).copied().unwrap_or(0),
                "connection unreachable, enforcing without it"
            );
        }

        let (balance, positions) = fetch_account(&reachable).await?;
        let fetched: Vec<&ConnectionId> = reachable.iter().map(|gw| gw.id()).collect();
        ledger.prune(&fetched, &positions);

        let max = self.config.max_positions;
        let now = Utc::now();
        let plans = self.plan_within(
            &positions,
            balance,
            ledger,
            &|p: &Position| {
                reachable
                    .iter()
                    .find(|g| g.id() == &p.connection)
                    .map_or(0.0, |g| g.min_notional(&p.symbol))
            },
            now,
            max.saturating_sub(stranded_open),
        );

        let mut closes = Vec::with_capacity(plans.len());
        for plan in plans {
            let Some(gateway) = reachable.iter().find(|g| g.id() == &plan.key.connection) else {
                warn!(position = %plan.key, "no gateway for position, skipping close");
                continue;
            };
            let order = OrderRequest::close(plan.key.symbol.clone(), plan.side, plan.quantity);
            let result = gateway.submit(&order).await;

            match (&result, plan.class) {
                (Ok(_), PositionClass::LegacyNonCompliant) if !plan.full => {
                    ledger.entries.insert(
                        plan.key.clone(),
                        UnwindProgress {
                            initial_quantity: plan.initial_quantity,
                            passes_done: plan.pass.unwrap_or(1),
                            last_pass_at: now,
                        },
                    );
                }
                (Ok(_), _) => {
                    ledger.entries.remove(&plan.key);
                }
                (Err(e), _) => {
                    warn!(position = %plan.key, class = ?plan.class, error = %e, "enforcement close failed");
                }
            }
            info!(
                account = %account,
                position = %plan.key,
                class = ?plan.class,
                quantity = plan.quantity,
                full = plan.full,
                pass = ?plan.pass,
                ok = result.is_ok(),
                "enforcement close"
            );
            closes.push(CloseOutcome {
                plan,
                error: result.err().map(|e| e.to_string()),
            });
        }

        let open_after = if closes.is_empty() {
            Some(positions.len() + stranded_open)
        } else {
            match fetch_account(&reachable).await {
                Ok((_, after)) => Some(after.len() + stranded_open),
                Err(e) => {
                    warn!(account = %account, error = %e, "post-enforcement re-fetch failed, cap unverified");
                    None
                }
            }
        };

        let violation = open_after.filter(|&open| open > max).map(|open| SafetyViolation {
            account: account.clone(),
            open,
            max,
        });
        if let Some(v) = &violation {
            safety.raise_violation(v);
        }

        Ok(EnforcementReport {
            account: account.clone(),
            balance,
            open_before: positions.len() + stranded_open,
            unreachable: unreachable.iter().map(|gw| gw.id().clone()).collect(),
            stranded_open,
            open_after,
            closes,
            violation,
        })
    }
}

/// Total balance and all positions across the account's connections.
async fn fetch_account(
    gateways: &[Arc<ConnectionGateway>],
) -> Result<(f64, Vec<Position>), EnforcementSkipped> {
    let fetches = gateways.iter().map(|gw| async move {
        let balance = gw.balance().await;
        let positions = gw.positions().await;
        (gw.id().to_string(), balance, positions)
    });

    let mut total = 0.0;
    let mut all = Vec::new();
    for (connection, balance, positions) in join_all(fetches).await {
        let balance = balance.map_err(|error| EnforcementSkipped::FetchFailed {
            connection: connection.clone(),
            error,
        })?;
        let positions =
            positions.map_err(|error| EnforcementSkipped::FetchFailed { connection, error })?;
        total += balance;
        all.extend(positions);
    }
    Ok((total, all))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
