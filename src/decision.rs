//! # decision
//!
//! The trading strategy seam. The orchestrator calls
//! [`DecisionEngine::evaluate`] once per cycle with the account, a market
//! snapshot and the open positions, and treats it as a pure function: the
//! engine never touches brokers, loop state or safety gates.

use crate::models::{Account, Action, MarketSnapshot, Position};

pub trait DecisionEngine: Send + Sync {
    fn evaluate(
        &self,
        account: &Account,
        snapshot: &MarketSnapshot,
        open_positions: &[Position],
    ) -> Vec<Action>;
}

/// Placeholder strategy: never trades. The binary runs with this until a
/// real engine is wired in; safety enforcement still runs every cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct HoldEngine;

impl DecisionEngine for HoldEngine {
    fn evaluate(&self, _: &Account, _: &MarketSnapshot, _: &[Position]) -> Vec<Action> {
        Vec::new()
    }
}
