pub mod control;
pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::{require_api_key, HEALTH_PATH};
use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ────────────────────────────────────────────────────────────
        .route(HEALTH_PATH,                          get(health::health))
        .route("/api/accounts/:account_id/can-trade", get(health::can_trade))
        .route("/api/loops",                         get(health::list_loops))
        .route("/api/loops/:account_id/:exchange",   get(health::get_loop))
        .route("/api/safety/audit",                  get(health::audit))
        // ── Control ───────────────────────────────────────────────────────────
        .route("/api/control/kill",                  post(control::kill_global))
        .route("/api/control/rearm",                 post(control::rearm_global))
        .route("/api/accounts/:account_id/kill",     post(control::kill_account))
        .route("/api/accounts/:account_id/rearm",    post(control::rearm_account))
        .route("/api/accounts",                      post(control::add_account))
        .route("/api/accounts/:account_id",          delete(control::remove_account))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
