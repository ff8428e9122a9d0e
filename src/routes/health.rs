//! # routes::health
//!
//! Read-only views over the safety layer and the trading loops.
//!
//! | Method | Path                                  | Description                     |
//! |--------|---------------------------------------|---------------------------------|
//! | GET    | `/api/health`                         | Liveness + global summary       |
//! | GET    | `/api/accounts/:account_id/can-trade` | Account-level trade gate        |
//! | GET    | `/api/loops`                          | Every trading loop's status     |
//! | GET    | `/api/loops/:account_id/:exchange`    | One trading loop's status       |
//! | GET    | `/api/safety/audit`                   | Recent safety transitions       |

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{
    error::AppError,
    models::{AccountId, ExchangeId},
    scheduler::LoopState,
    state::SharedState,
};

// ─── GET /api/health ──────────────────────────────────────────────────────────

pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let statuses = state.scheduler.loop_statuses();
    let mut loops: BTreeMap<String, usize> = BTreeMap::new();
    for status in &statuses {
        let key = serde_json::to_value(status.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        *loops.entry(key).or_default() += 1;
    }

    Json(json!({
        "ok":          true,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "accounts":    state.registry.len(),
        "loops":       loops,
        "safety":      state.safety.status(),
    }))
}

// ─── GET /api/accounts/:account_id/can-trade ─────────────────────────────────

pub async fn can_trade(
    State(state): State<SharedState>,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let account = AccountId::new(account_id);
    let Some(registered) = state.registry.get(&account) else {
        return Err(AppError::NotFound(format!("unknown account {account}")));
    };
    let loops: BTreeMap<String, Option<LoopState>> = registered
        .connections
        .iter()
        .map(|c| {
            let exchange = c.exchange();
            (exchange.to_string(), state.scheduler.loop_state(&account, exchange))
        })
        .collect();

    Ok(Json(json!({
        "ok":        true,
        "account":   account,
        "can_trade": state.safety.can_trade(&account),
        "loops":     loops,
    })))
}

// ─── GET /api/loops ───────────────────────────────────────────────────────────

pub async fn list_loops(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "loops": state.scheduler.loop_statuses() }))
}

// ─── GET /api/loops/:account_id/:exchange ─────────────────────────────────────

pub async fn get_loop(
    State(state): State<SharedState>,
    Path((account_id, exchange)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let account = AccountId::new(account_id);
    let exchange = ExchangeId::new(exchange);
    match state.scheduler.loop_status(&account, &exchange) {
        Some(status) => Ok(Json(json!({ "ok": true, "loop": status }))),
        None => Err(AppError::NotFound(format!(
            "no trading loop for {account}/{exchange}"
        ))),
    }
}

// ─── GET /api/safety/audit ────────────────────────────────────────────────────

pub async fn audit(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "audit": state.safety.audit_trail() }))
}
