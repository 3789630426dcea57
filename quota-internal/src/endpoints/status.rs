use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::gateway_util::AppState;

pub const QUOTA_GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler(State(app_state): AppState) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": QUOTA_GATEWAY_VERSION,
        "counterBackend": app_state.quota.active_backend().as_ref(),
        "metrics": app_state.quota.metrics(),
    }))
}

/// A handler for a health check that includes the quota stores
pub async fn health_handler(State(app_state): AppState) -> Response {
    match app_state.quota.health().await {
        Ok(()) => Json(json!({ "gateway": "ok", "quota": "ok" })).into_response(),
        Err(e) => {
            tracing::warn!("Quota stores failed the health check: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "gateway": "ok", "quota": "error" })),
            )
                .into_response()
        }
    }
}
