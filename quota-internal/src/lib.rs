//! Quota checks and usage accounting for AI features.
//!
//! The `gateway` binary serves the quota API (`/v1/quota/*`) for services that
//! check and record usage over HTTP. Services that host AI feature routes
//! in-process mount [`rate_limit::middleware::quota_middleware`] instead:
//!
//! ```ignore
//! let router = Router::new()
//!     .route("/v1/ai/{feature}/run", post(run_feature))
//!     .layer(axum::middleware::from_fn_with_state(
//!         app_state.quota.clone(),
//!         quota_middleware,
//!     ));
//! ```
//!
//! The layer reads `x-user-id` and `x-subscription-tier`, and takes the feature
//! from `x-ai-feature` or the `/v1/ai/{feature}/...` path.

pub mod config_parser; // quota gateway config file
pub mod counter; // hourly/daily usage counters (Redis, in-memory, durable log)
pub mod db; // Postgres policies, overrides and usage log
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod policy; // effective limit resolution
pub mod rate_limit; // quota checks and the 429 response
pub mod redis_client; // redis client
pub mod service;
mod testing;
pub mod types;
pub mod usage; // usage recording and stats
