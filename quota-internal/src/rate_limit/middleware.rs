use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::RateLimitExceeded;
use crate::service::QuotaService;
use crate::types::{Feature, SubscriptionTier};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SUBSCRIPTION_TIER_HEADER: &str = "x-subscription-tier";
pub const FEATURE_HEADER: &str = "x-ai-feature";

/// Quota enforcement around an AI feature route.
///
/// Checks before the handler runs and records every invocation. Denials are
/// logged without running the handler, and only 2xx responses count. The
/// `X-RateLimit-*` headers are added to whatever the handler produced.
/// The feature comes from the `x-ai-feature` header, or else from paths shaped like
/// `/v1/ai/{feature}/...`.
pub async fn quota_middleware(
    State(quota): State<QuotaService>,
    request: Request,
    next: Next,
) -> Result<Response, QuotaRejection> {
    let user_id = extract_user_id(&request)?;
    let tier = extract_tier(&request)?;
    let feature = extract_feature(&request)?;

    let path = request.uri().path().to_string();
    let decision = quota.check(&user_id, feature, tier).await;
    if !decision.allowed {
        // Denials stay in the usage log but never count toward the quota.
        quota
            .record(
                &user_id,
                feature,
                false,
                Some(json!({ "path": path, "status": StatusCode::TOO_MANY_REQUESTS.as_u16() })),
            )
            .await;
        return Err(QuotaRejection::Exceeded(RateLimitExceeded { feature, decision }));
    }

    let mut response = next.run(request).await;
    let status = response.status();
    debug!(
        feature = feature.as_ref(),
        status = status.as_u16(),
        remaining = decision.remaining,
        "Recording AI feature usage"
    );
    quota
        .record(
            &user_id,
            feature,
            status.is_success(),
            Some(json!({ "path": path, "status": status.as_u16() })),
        )
        .await;

    response
        .headers_mut()
        .extend(decision.headers().to_header_map());
    Ok(response)
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn extract_user_id(request: &Request) -> Result<String, QuotaRejection> {
    header_str(request, USER_ID_HEADER)
        .map(str::to_string)
        .ok_or_else(|| {
            QuotaRejection::Request(Error::new(ErrorDetails::InvalidRequest {
                message: format!("Missing `{USER_ID_HEADER}` header"),
            }))
        })
}

fn extract_tier(request: &Request) -> Result<SubscriptionTier, QuotaRejection> {
    let tier = header_str(request, SUBSCRIPTION_TIER_HEADER).ok_or_else(|| {
        QuotaRejection::Request(Error::new(ErrorDetails::InvalidRequest {
            message: format!("Missing `{SUBSCRIPTION_TIER_HEADER}` header"),
        }))
    })?;
    SubscriptionTier::parse(tier).map_err(QuotaRejection::Request)
}

fn extract_feature(request: &Request) -> Result<Feature, QuotaRejection> {
    if let Some(feature) = header_str(request, FEATURE_HEADER) {
        return Feature::parse(feature).map_err(QuotaRejection::Request);
    }
    match try_extract_from_path(request.uri().path()) {
        Some(feature) => Feature::parse(feature).map_err(QuotaRejection::Request),
        None => Err(QuotaRejection::Request(Error::new(
            ErrorDetails::InvalidRequest {
                message: format!(
                    "Could not determine the AI feature for `{}`. Set the `{FEATURE_HEADER}` header.",
                    request.uri().path()
                ),
            },
        ))),
    }
}

/// `/v1/ai/{feature}/...`
fn try_extract_from_path(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some("v1"), Some("ai"), Some(feature)) if !feature.is_empty() => Some(feature),
        _ => None,
    }
}

#[derive(Debug)]
pub enum QuotaRejection {
    Exceeded(RateLimitExceeded),
    Request(Error),
}

impl IntoResponse for QuotaRejection {
    fn into_response(self) -> Response {
        match self {
            QuotaRejection::Exceeded(exceeded) => exceeded.into_response(),
            QuotaRejection::Request(e) => e.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{get_unit_test_app_state_data, get_unit_test_quota};
    use axum::body::{to_bytes, Body};
    use axum::routing::post;
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(quota: QuotaService) -> Router {
        Router::new()
            .route("/v1/ai/{feature}/run", post(|| async { "done" }))
            .route(
                "/v1/ai/{feature}/broken",
                post(|| async { StatusCode::BAD_GATEWAY }),
            )
            .route("/v1/other", post(|| async { "done" }))
            .layer(axum::middleware::from_fn_with_state(quota, quota_middleware))
    }

    fn request(uri: &str, user: Option<&str>, tier: Option<&str>) -> Request {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        if let Some(tier) = tier {
            builder = builder.header(SUBSCRIPTION_TIER_HEADER, tier);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_try_extract_from_path() {
        assert_eq!(
            try_extract_from_path("/v1/ai/cover_letter/run"),
            Some("cover_letter")
        );
        assert_eq!(
            try_extract_from_path("/v1/ai/resume_analysis"),
            Some("resume_analysis")
        );
        assert_eq!(try_extract_from_path("/v1/other"), None);
        assert_eq!(try_extract_from_path("/v1/ai/"), None);
    }

    #[tokio::test]
    async fn test_allows_then_rejects_with_429() {
        let quota = get_unit_test_quota(true).await;
        let app = app(quota.service.clone());

        let response = app
            .clone()
            .oneshot(request(
                "/v1/ai/resume_analysis/run",
                Some("user-1"),
                Some("free"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "1");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        assert!(response.headers().contains_key("X-RateLimit-Reset"));
        assert_eq!(quota.db.usage_records().await.len(), 1);

        let response = app
            .oneshot(request(
                "/v1/ai/resume_analysis/run",
                Some("user-1"),
                Some("free"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("Retry-After"));
        let body = json_body(response).await;
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["limit"], 1);
        assert_eq!(body["remaining"], 0);
        assert!(body["resetAt"].as_str().unwrap().ends_with('Z'));

        // The denial is logged as an unsuccessful invocation.
        let records = quota.db.usage_records().await;
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);
        assert_eq!(
            records[1].metadata,
            Some(json!({"path": "/v1/ai/resume_analysis/run", "status": 429}))
        );

        // Logging the denial does not move the counters.
        let stats = quota
            .service
            .stats_for("user-1", Feature::ResumeAnalysis, SubscriptionTier::Free)
            .await
            .unwrap();
        assert_eq!(stats.hourly_used, 1);
        assert_eq!(stats.daily_used, 1);
    }

    #[tokio::test]
    async fn test_failed_handler_does_not_consume_quota() {
        let quota = get_unit_test_quota(true).await;
        let app = app(quota.service.clone());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(
                    "/v1/ai/resume_analysis/broken",
                    Some("user-1"),
                    Some("free"),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        let records = quota.db.usage_records().await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| !r.success));
        assert_eq!(
            records[0].metadata,
            Some(json!({"path": "/v1/ai/resume_analysis/broken", "status": 502}))
        );
    }

    #[tokio::test]
    async fn test_feature_header_takes_priority() {
        let quota = get_unit_test_quota(true).await;
        let mut req = request("/v1/other", Some("user-1"), Some("pro"));
        req.headers_mut()
            .insert(FEATURE_HEADER, "career_advice".parse().unwrap());

        let response = app(quota.service.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "4");
        let records = quota.db.usage_records().await;
        assert_eq!(records[0].feature, Feature::CareerAdvice);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let quota = get_unit_test_quota(true).await;
        let app = app(quota.service.clone());

        let missing_user = app
            .clone()
            .oneshot(request("/v1/ai/cover_letter/run", None, Some("pro")))
            .await
            .unwrap();
        assert_eq!(missing_user.status(), StatusCode::BAD_REQUEST);

        let unknown_tier = app
            .clone()
            .oneshot(request(
                "/v1/ai/cover_letter/run",
                Some("user-1"),
                Some("platinum"),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_tier.status(), StatusCode::BAD_REQUEST);

        let unknown_feature = app
            .clone()
            .oneshot(request("/v1/ai/poetry/run", Some("user-1"), Some("pro")))
            .await
            .unwrap();
        assert_eq!(unknown_feature.status(), StatusCode::NOT_FOUND);

        let no_feature = app
            .oneshot(request("/v1/other", Some("user-1"), Some("pro")))
            .await
            .unwrap();
        assert_eq!(no_feature.status(), StatusCode::BAD_REQUEST);
        assert!(quota.db.usage_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_open_when_stores_are_down() {
        let quota = get_unit_test_quota(true).await;
        quota.db.set_healthy(false);
        if let Some(fast) = &quota.fast {
            fast.set_healthy(false);
        }

        let response = app(quota.service.clone())
            .oneshot(request(
                "/v1/ai/interview_prep/run",
                Some("user-1"),
                Some("free"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "1000");
        assert_eq!(quota.service.metrics().fail_opens, 1);
    }

    #[tokio::test]
    async fn test_layer_over_app_state_quota() {
        let app_state = get_unit_test_app_state_data(true).await;
        let app = Router::new()
            .route("/v1/ai/{feature}/run", post(|| async { "done" }))
            .layer(axum::middleware::from_fn_with_state(
                app_state.quota.clone(),
                quota_middleware,
            ));

        let response = app
            .oneshot(request("/v1/ai/career_advice/run", Some("user-9"), Some("ai_coach")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "10");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "9");

        let stats = app_state
            .quota
            .stats_for("user-9", Feature::CareerAdvice, SubscriptionTier::AiCoach)
            .await
            .unwrap();
        assert_eq!(stats.hourly_used, 1);
    }
}
