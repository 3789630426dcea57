use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;

use crate::types::{Feature, WindowKind};

pub mod limiter;
pub mod middleware;

pub use limiter::RateLimiter;

/// Why a check came out the way it did.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Allowed,
    DeniedHourly,
    DeniedDaily,
    DeniedNoPolicy,
    /// Allowed because the stores could not answer in time
    FailOpen,
    /// Denied because the stores could not answer and failing open is disabled
    FailClosed,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Allowed => "allowed",
            DecisionOutcome::DeniedHourly => "denied_hourly",
            DecisionOutcome::DeniedDaily => "denied_daily",
            DecisionOutcome::DeniedNoPolicy => "denied_no_policy",
            DecisionOutcome::FailOpen => "fail_open",
            DecisionOutcome::FailClosed => "fail_closed",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, DecisionOutcome::Allowed | DecisionOutcome::FailOpen)
    }

    pub fn denied_window(&self) -> Option<WindowKind> {
        match self {
            DecisionOutcome::DeniedHourly => Some(WindowKind::Hourly),
            DecisionOutcome::DeniedDaily => Some(WindowKind::Daily),
            _ => None,
        }
    }
}

/// Result of a quota check
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    #[serde(serialize_with = "serialize_reset")]
    pub reset_at: DateTime<Utc>,
    /// Present only on denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub outcome: DecisionOutcome,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders::from_decision(self)
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-02-01T10:00:00.000Z`.
pub fn format_reset(reset_at: &DateTime<Utc>) -> String {
    reset_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn serialize_reset<S: serde::Serializer>(
    reset_at: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_reset(reset_at))
}

pub fn serialize_optional_reset<S: serde::Serializer>(
    reset_at: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match reset_at {
        Some(reset_at) => serialize_reset(reset_at, serializer),
        None => serializer.serialize_none(),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
    pub retry_after: Option<u64>, // Seconds
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at,
            retry_after: decision.retry_after_seconds,
        }
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numbers and RFC 3339 timestamps are always valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&format_reset(&self.reset)) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// A denied check, rendered as HTTP 429.
#[derive(Debug)]
pub struct RateLimitExceeded {
    pub feature: Feature,
    pub decision: RateLimitDecision,
}

impl RateLimitExceeded {
    pub fn message(&self) -> String {
        let feature = self.feature;
        let retry_after = self.decision.retry_after_seconds.unwrap_or(0);
        let reset = format_reset(&self.decision.reset_at);
        match self.decision.outcome.denied_window() {
            Some(window) => format!(
                "You have used all {} {window} requests for {feature}. Try again in {retry_after} seconds (at {reset}).",
                self.decision.limit
            ),
            None if self.decision.outcome == DecisionOutcome::FailClosed => format!(
                "Usage limits for {feature} cannot be checked right now. Try again in {retry_after} seconds."
            ),
            None => format!(
                "{feature} is not available on your current plan. Try again after {reset}."
            ),
        }
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": "Rate limit exceeded",
            "message": self.message(),
            "limit": self.decision.limit,
            "remaining": 0,
            "resetAt": format_reset(&self.decision.reset_at),
        })
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let headers = self.decision.headers().to_header_map();
        (StatusCode::TOO_MANY_REQUESTS, headers, Json(self.body())).into_response()
    }
}
