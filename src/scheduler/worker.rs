//! One trading loop: a single (account, connection) pair on its own task.
//!
//! Cycles are single-flight. The next cycle starts at `started + interval`,
//! or immediately when a cycle overruns. Errors never leave the task: a
//! transient error backs off and retries, a fatal error waits for the next
//! cycle, and a panic is caught and treated as transient.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::decision::DecisionEngine;
use crate::engine::{ConnectionGateway, PositionCapEnforcer};
use crate::error::{ErrorClass, WorkerError};
use crate::models::{Action, MarketSnapshot, OrderRequest};
use crate::safety::{BlockReason, Gate, SafetyController};
use crate::scheduler::backoff::CycleBackoff;
use crate::scheduler::desk::AccountDesk;
use crate::scheduler::{LoopState, SchedulerConfig, TradingLoopStatus};

pub(crate) struct Worker {
    pub gateway: Arc<ConnectionGateway>,
    pub desk: Arc<AccountDesk>,
    pub safety: Arc<SafetyController>,
    pub engine: Arc<dyn DecisionEngine>,
    pub enforcer: Arc<PositionCapEnforcer>,
    pub config: SchedulerConfig,
    pub status: Arc<RwLock<TradingLoopStatus>>,
    pub stop: watch::Receiver<bool>,
    /// Poked when enforcement changed state worth snapshotting.
    pub snapshot_due: Arc<Notify>,
}

enum Next {
    Interval,
    Backoff(Duration),
    Fail(String),
}

impl Worker {
    pub async fn run(mut self, start_delay: Duration) {
        if self.sleep_or_stop(Instant::now() + start_delay).await {
            self.transition(LoopState::Stopped, "stopped before start");
            return;
        }
        self.transition(LoopState::Running, "started");

        let mut backoff = CycleBackoff::from_config(&self.config);
        let mut cycle: u64 = 0;

        loop {
            if *self.stop.borrow() {
                break;
            }
            let started = Instant::now();

            self.safety.poll_sentinel();
            let gate = self.safety.gate_on(self.gateway.id());
            let next = match gate {
                Gate::Blocked(reason) if reason != BlockReason::BalanceBelowMinimum => {
                    self.transition(LoopState::Paused, &reason.to_string());
                    Next::Interval
                }
                gate => {
                    if self.state() == LoopState::Paused {
                        self.transition(LoopState::Running, "gate reopened");
                    }
                    let outcome = AssertUnwindSafe(self.cycle(cycle, gate.is_open()))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(&panic))));
                    cycle += 1;
                    self.settle(outcome, &mut backoff)
                }
            };

            let deadline = match next {
                Next::Fail(reason) => {
                    self.desk.mark_failed(self.gateway.id());
                    self.transition(LoopState::Failed, &reason);
                    return;
                }
                Next::Backoff(delay) => Instant::now() + delay,
                Next::Interval => {
                    let deadline = started + self.config.cycle_interval;
                    if Instant::now() > deadline {
                        warn!(
                            connection = %self.gateway.id(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "cycle overran its interval, starting next immediately"
                        );
                    }
                    deadline
                }
            };
            if self.sleep_or_stop(deadline).await {
                break;
            }
        }

        self.transition(LoopState::Stopped, "shutdown requested");
    }

    /// Record the cycle outcome and decide when the next cycle runs.
    fn settle(&self, outcome: Result<(), WorkerError>, backoff: &mut CycleBackoff) -> Next {
        let id = self.gateway.id().clone();
        match outcome {
            Ok(()) => {
                backoff.on_success();
                let mut status = self.status.write();
                status.consecutive_errors = 0;
                status.consecutive_fatal = 0;
                status.last_error = None;
                Next::Interval
            }
            Err(err) if err.is_fatal() => {
                let fatal = {
                    let mut status = self.status.write();
                    status.consecutive_fatal += 1;
                    status.last_error = Some(err.to_string());
                    status.consecutive_fatal
                };
                error!(connection = %id, error = %err, consecutive = fatal, "fatal broker error");
                if fatal >= self.config.max_fatal_errors {
                    self.safety.record_fatal(&id);
                    Next::Fail(format!("{fatal} consecutive fatal errors: {err}"))
                } else {
                    Next::Interval
                }
            }
            Err(err) => {
                let attempts = {
                    let mut status = self.status.write();
                    status.consecutive_errors += 1;
                    status.consecutive_fatal = 0;
                    status.last_error = Some(err.to_string());
                    status.consecutive_errors
                };
                let Some(delay) = backoff.on_failure() else {
                    return Next::Fail(format!("retries exhausted after {attempts} errors: {err}"));
                };
                warn!(
                    connection = %id,
                    error = %err,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "cycle failed, backing off"
                );
                Next::Backoff(delay)
            }
        }
    }

    async fn cycle(&self, n: u64, trading_allowed: bool) -> Result<(), WorkerError> {
        let id = self.gateway.id();
        {
            let mut status = self.status.write();
            status.cycles += 1;
            status.last_cycle_at = Some(Utc::now());
        }

        let balance = self.gateway.balance().await?;
        self.safety.record_balance(id, balance);
        // Balance below minimum: keep observing so the gate can reopen, but
        // place nothing.
        let tradable = trading_allowed && self.safety.can_trade_on(id);

        let every = u64::from(self.enforcer.config().every_cycles.max(1));
        if tradable && n % every == 0 {
            if let Some(report) = self.desk.try_enforce(&self.enforcer, &self.safety).await {
                if !report.closes.is_empty() || report.violation.is_some() {
                    self.snapshot_due.notify_one();
                    info!(
                        account = %report.account,
                        before = report.open_before,
                        after = ?report.open_after,
                        unreachable = report.unreachable.len(),
                        stranded = report.stranded_open,
                        closed = report.closed(),
                        "position cap enforced"
                    );
                }
            }
        }

        let positions = self.gateway.positions().await?;
        self.desk.record_open(id, positions.len());

        if !tradable {
            debug!(connection = %id, "observe-only cycle");
            return Ok(());
        }

        let snapshot = MarketSnapshot {
            account: self.desk.account.id.clone(),
            connection: id.clone(),
            balance,
            taken_at: Utc::now(),
        };
        let actions = self.engine.evaluate(&self.desk.account, &snapshot, &positions);
        let max_positions = self.enforcer.config().max_positions;

        for action in actions {
            // A kill engaged mid-cycle stops the remaining actions.
            if !self.safety.can_trade_on(id) {
                info!(connection = %id, "gate closed mid-cycle, dropping remaining actions");
                break;
            }
            let order = match action {
                Action::Open { symbol, side, quantity } => {
                    if self.desk.aggregated_open() >= max_positions {
                        debug!(connection = %id, %symbol, max_positions, "open skipped: account at position cap");
                        continue;
                    }
                    OrderRequest::open(symbol, side, quantity)
                }
                Action::Close { symbol, quantity } => {
                    let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
                        debug!(connection = %id, %symbol, "close skipped: no such position");
                        continue;
                    };
                    let qty = quantity.unwrap_or(position.quantity).min(position.quantity);
                    OrderRequest::close(symbol, position.side.opposite(), qty)
                }
            };

            match self.gateway.submit(&order).await {
                Ok(_) => {
                    self.status.write().orders_placed += 1;
                    if !order.reduce_only {
                        self.desk.note_opened(id);
                    }
                }
                Err(e) => match e.class() {
                    ErrorClass::OrderLevel => {
                        warn!(connection = %id, symbol = %order.symbol, error = %e, "order refused");
                    }
                    ErrorClass::NonceConflict => {
                        return Err(WorkerError::NonceConflict(id.exchange.clone()));
                    }
                    _ => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    fn state(&self) -> LoopState {
        self.status.read().state
    }

    fn transition(&self, to: LoopState, reason: &str) {
        let from = {
            let mut status = self.status.write();
            let from = status.state;
            if from == to {
                return;
            }
            status.state = to;
            if to == LoopState::Paused {
                status.paused_reason = Some(reason.to_string());
            } else {
                status.paused_reason = None;
            }
            from
        };
        info!(connection = %self.gateway.id(), ?from, ?to, reason, "trading loop state");
        self.safety.record_loop_transition(self.gateway.id(), from, to, reason);
    }

    /// Sleep until `deadline`; true when a stop was requested meanwhile.
    async fn sleep_or_stop(&mut self, deadline: Instant) -> bool {
        if *self.stop.borrow() {
            return true;
        }
        let sender_gone = tokio::select! {
            _ = sleep_until(deadline) => return false,
            changed = self.stop.changed() => changed.is_err(),
        };
        let requested = *self.stop.borrow();
        sender_gone || requested
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
