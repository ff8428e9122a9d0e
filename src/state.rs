//! # state
//!
//! Shared application state injected into every axum handler. Cloning is
//! cheap: every field is an `Arc` (or small and `Clone`).

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::registry::AccountRegistry;
use crate::safety::SafetyController;
use crate::scheduler::TradingLoopScheduler;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AccountRegistry>,
    pub safety: Arc<SafetyController>,
    pub scheduler: Arc<TradingLoopScheduler>,
    /// Expected `X-API-Key` on control routes. `None` leaves them open (dev mode).
    pub api_key: Option<String>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

pub fn build_state(
    registry: Arc<AccountRegistry>,
    safety: Arc<SafetyController>,
    scheduler: Arc<TradingLoopScheduler>,
) -> SharedState {
    let api_key = std::env::var("CONTROL_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty());
    Arc::new(AppState {
        registry,
        safety,
        scheduler,
        api_key,
        started_at: Utc::now(),
    })
}
