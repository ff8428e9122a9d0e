//! # auth: API Key Middleware
//!
//! Guards the control surface with an `X-API-Key` header.
//!
//! ## Mode
//! - `CONTROL_API_KEY` unset or empty → **allow all** (dev mode)
//! - `CONTROL_API_KEY` set → every request must carry `X-API-Key: <key>`
//!
//! `/api/health` is always open so liveness checks need no secret.
//!
//! ```bash
//! curl -X POST -H "X-API-Key: $CONTROL_API_KEY" http://localhost:3000/api/control/kill
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::state::SharedState;

pub const HEALTH_PATH: &str = "/api/health";

pub async fn require_api_key(
    State(state): State<SharedState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if path == HEALTH_PATH {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected {
        next.run(request).await
    } else {
        warn!(path, "❌ unauthorized control request: invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
            })),
        )
            .into_response()
    }
}
