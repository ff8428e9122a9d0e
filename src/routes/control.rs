//! # routes::control
//!
//! Operator kill switches.
//!
//! | Method | Path                              | Description                  |
//! |--------|-----------------------------------|------------------------------|
//! | POST   | `/api/control/kill`               | Engage the global kill       |
//! | POST   | `/api/control/rearm`              | Release the global kill      |
//! | POST   | `/api/accounts/:account_id/kill`  | Engage one account's kill    |
//! | POST   | `/api/accounts/:account_id/rearm` | Release one account's kill   |
//! | POST   | `/api/accounts`                   | Register and schedule account|
//! | DELETE | `/api/accounts/:account_id`       | Stop and deregister account  |
//!
//! A kill takes effect at each worker's next cycle boundary; orders already
//! in flight complete.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::{
    error::AppError,
    models::{AccountConfig, AccountId},
    state::SharedState,
};

#[derive(Deserialize)]
pub struct KillBody {
    pub reason: Option<String>,
}

fn reason_of(body: Option<Json<KillBody>>) -> String {
    body.and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual kill via control API".to_string())
}

/// POST /api/control/kill
pub async fn kill_global(
    State(state): State<SharedState>,
    body: Option<Json<KillBody>>,
) -> impl IntoResponse {
    let reason = reason_of(body);
    state.safety.engage_global(&reason);

    (StatusCode::OK, Json(json!({
        "ok":      true,
        "message": format!("Global kill switch engaged: {reason}"),
    })))
}

/// POST /api/control/rearm
pub async fn rearm_global(State(state): State<SharedState>) -> impl IntoResponse {
    state.safety.release_global();
    let halted = state.safety.poll_sentinel();

    Json(json!({
        "ok":      true,
        "halted":  halted,
        "message": if halted {
            "Emergency stop marker still present; global kill remains engaged"
        } else {
            "Global kill released; trading resumes at the next cycle"
        },
    }))
}

/// POST /api/accounts/:account_id/kill
pub async fn kill_account(
    State(state): State<SharedState>,
    Path(account_id): Path<String>,
    body: Option<Json<KillBody>>,
) -> Result<impl IntoResponse, AppError> {
    let account = AccountId::new(account_id);
    let reason = reason_of(body);
    if !state.safety.engage_account(&account, &reason) {
        return Err(AppError::NotFound(format!("unknown account {account}")));
    }
    state.scheduler.snapshot_signal().notify_one();

    Ok(Json(json!({
        "ok":      true,
        "account": account,
        "message": format!("Account kill switch engaged: {reason}"),
    })))
}

/// POST /api/accounts/:account_id/rearm
pub async fn rearm_account(
    State(state): State<SharedState>,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let account = AccountId::new(account_id);
    if !state.safety.release_account(&account) {
        return Err(AppError::NotFound(format!("unknown account {account}")));
    }
    state.scheduler.snapshot_signal().notify_one();

    Ok(Json(json!({
        "ok":      true,
        "account": account,
        "message": "Account re-armed; trading resumes at the next cycle",
    })))
}

/// POST /api/accounts
///
/// Body is one accounts-file entry. Re-posting an identical entry is a no-op.
pub async fn add_account(
    State(state): State<SharedState>,
    Json(config): Json<AccountConfig>,
) -> Result<impl IntoResponse, AppError> {
    let account = state
        .registry
        .register(config)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    if let Err(e) = state.scheduler.add_account(Arc::clone(&account)) {
        state.registry.remove(&account.id);
        return Err(AppError::BadRequest(e.to_string()));
    }
    state.scheduler.snapshot_signal().notify_one();

    let exchanges: Vec<String> = account
        .connections
        .iter()
        .map(|c| c.exchange().to_string())
        .collect();
    Ok((StatusCode::CREATED, Json(json!({
        "ok":        true,
        "account":   account.id,
        "exchanges": exchanges,
        "message":   "Account registered; trading loops starting",
    }))))
}

/// DELETE /api/accounts/:account_id
///
/// Workers stop at their next cycle boundary; the response is sent once they
/// have.
pub async fn remove_account(
    State(state): State<SharedState>,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let account = AccountId::new(account_id);
    let scheduled = state.scheduler.remove_account(&account).await;
    let registered = state.registry.remove(&account).is_some();
    if !scheduled && !registered {
        return Err(AppError::NotFound(format!("unknown account {account}")));
    }
    state.scheduler.snapshot_signal().notify_one();

    Ok(Json(json!({
        "ok":      true,
        "account": account,
        "message": "Account stopped and removed",
    })))
}
