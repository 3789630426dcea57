use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, StructuredJson};
use crate::rate_limit::RateLimitExceeded;
use crate::types::{Feature, SubscriptionTier};
use crate::usage::UsageStats;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CheckParams {
    pub user_id: String,
    pub feature: String,
    pub tier: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RecordParams {
    pub user_id: String,
    pub feature: String,
    pub success: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub tier: Option<String>,
}

impl StatsQuery {
    fn tier(&self) -> Result<SubscriptionTier, Error> {
        match &self.tier {
            Some(tier) => SubscriptionTier::parse(tier),
            None => Err(Error::new(ErrorDetails::InvalidRequest {
                message: "Missing `tier` query parameter".to_string(),
            })),
        }
    }
}

fn require_user_id(user_id: &str) -> Result<(), Error> {
    if user_id.trim().is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`userId` must not be empty".to_string(),
        }));
    }
    Ok(())
}

/// `POST /v1/quota/check`: the decision body on allow, the 429 body on deny.
/// Both carry the `X-RateLimit-*` headers.
#[instrument(name = "quota_check", skip_all)]
pub async fn check_handler(
    State(app_state): AppState,
    StructuredJson(params): StructuredJson<CheckParams>,
) -> Result<Response, Error> {
    require_user_id(&params.user_id)?;
    let feature = Feature::parse(&params.feature)?;
    let tier = SubscriptionTier::parse(&params.tier)?;

    let decision = app_state.quota.check(&params.user_id, feature, tier).await;
    if !decision.allowed {
        return Ok(RateLimitExceeded { feature, decision }.into_response());
    }
    let headers = decision.headers().to_header_map();
    Ok((StatusCode::OK, headers, Json(decision)).into_response())
}

/// `POST /v1/quota/record`. Always 202 once the request is valid.
#[instrument(name = "quota_record", skip_all)]
pub async fn record_handler(
    State(app_state): AppState,
    StructuredJson(params): StructuredJson<RecordParams>,
) -> Result<StatusCode, Error> {
    require_user_id(&params.user_id)?;
    let feature = Feature::parse(&params.feature)?;
    app_state
        .quota
        .record(&params.user_id, feature, params.success, params.metadata)
        .await;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /v1/quota/stats/{user_id}?tier=...`
pub async fn all_stats_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<UsageStats>>, Error> {
    let tier = query.tier()?;
    app_state.quota.all_stats(&user_id, tier).await.map(Json)
}

/// `GET /v1/quota/stats/{user_id}/{feature}?tier=...`
pub async fn feature_stats_handler(
    State(app_state): AppState,
    Path((user_id, feature)): Path<(String, String)>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<UsageStats>, Error> {
    let tier = query.tier()?;
    let feature = Feature::parse(&feature)?;
    app_state
        .quota
        .stats_for(&user_id, feature, tier)
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::quota_router;
    use crate::testing::get_unit_test_app_state_data;
    use axum::body::{to_bytes, Body};
    use axum::extract::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: Value) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_record_and_stats_over_http() {
        let app = quota_router().with_state(get_unit_test_app_state_data(true).await);
        let check = json!({"userId": "user-1", "feature": "resume_analysis", "tier": "free"});

        let response = app
            .clone()
            .oneshot(post_json("/v1/quota/check", check.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        let body = json_body(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["outcome"], "allowed");

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/quota/record",
                json!({"userId": "user-1", "feature": "resume_analysis", "success": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .clone()
            .oneshot(post_json("/v1/quota/check", check))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["limit"], 1);

        let response = app
            .clone()
            .oneshot(get("/v1/quota/stats/user-1/resume_analysis?tier=free"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["hourlyUsed"], 1);
        assert_eq!(body["hourlyRemaining"], 0);
        assert_eq!(body["dailyRemaining"], 1);

        let response = app
            .oneshot(get("/v1/quota/stats/user-1?tier=free"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let app = quota_router().with_state(get_unit_test_app_state_data(true).await);

        let unknown_feature = app
            .clone()
            .oneshot(post_json(
                "/v1/quota/check",
                json!({"userId": "user-1", "feature": "poetry", "tier": "free"}),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_feature.status(), StatusCode::NOT_FOUND);

        let extra_field = app
            .clone()
            .oneshot(post_json(
                "/v1/quota/check",
                json!({"userId": "user-1", "feature": "cover_letter", "tier": "free", "bonus": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(extra_field.status(), StatusCode::BAD_REQUEST);

        let empty_user = app
            .clone()
            .oneshot(post_json(
                "/v1/quota/record",
                json!({"userId": " ", "feature": "cover_letter", "success": true}),
            ))
            .await
            .unwrap();
        assert_eq!(empty_user.status(), StatusCode::BAD_REQUEST);

        let missing_tier = app
            .oneshot(get("/v1/quota/stats/user-1"))
            .await
            .unwrap();
        assert_eq!(missing_tier.status(), StatusCode::BAD_REQUEST);
        let body = json_body(missing_tier).await;
        assert_eq!(body["error"], "Missing `tier` query parameter");
    }

    #[tokio::test]
    async fn test_stats_unavailable_when_stores_are_down() {
        let app = quota_router().with_state(get_unit_test_app_state_data(false).await);
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/quota/check",
                json!({"userId": "user-1", "feature": "cover_letter", "tier": "pro"}),
            ))
            .await
            .unwrap();
        // Policy lookup fails, so the check fails open.
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "fail_open");
        assert_eq!(body["limit"], 1000);

        let response = app
            .oneshot(get("/v1/quota/stats/user-1/cover_letter?tier=pro"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
