use axum::routing::{get, post};
use axum::Router;

use crate::gateway_util::AppStateData;

pub mod quota;
pub mod status;

/// Routes for the quota API. State is attached by the caller.
pub fn quota_router() -> Router<AppStateData> {
    Router::new()
        .route("/v1/quota/check", post(quota::check_handler))
        .route("/v1/quota/record", post(quota::record_handler))
        .route("/v1/quota/stats/{user_id}", get(quota::all_stats_handler))
        .route(
            "/v1/quota/stats/{user_id}/{feature}",
            get(quota::feature_stats_handler),
        )
        .route("/status", get(status::status_handler))
        .route("/health", get(status::health_handler))
}
