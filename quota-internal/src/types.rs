use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};

/// A rate-limited AI capability.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    ResumeAnalysis,
    InterviewPrep,
    CoverLetter,
    CareerAdvice,
    JobFitAnalysis,
}

impl Feature {
    pub fn all() -> impl Iterator<Item = Feature> {
        Feature::iter()
    }

    /// Parses a feature name coming from a request, mapping failures to `UnknownFeature`.
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse().map_err(|_| {
            Error::new(ErrorDetails::UnknownFeature {
                name: name.to_string(),
            })
        })
    }
}

#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Pro,
    AiCoach,
}

impl SubscriptionTier {
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse().map_err(|_| {
            Error::new(ErrorDetails::UnknownTier {
                name: name.to_string(),
            })
        })
    }
}

/// The two rolling accounting windows every check consults.
#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WindowKind {
    Hourly,
    Daily,
}

impl WindowKind {
    pub fn duration(&self) -> TimeDelta {
        match self {
            WindowKind::Hourly => TimeDelta::hours(1),
            WindowKind::Daily => TimeDelta::hours(24),
        }
    }

    /// Start of the rolling window ending at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration()
    }
}

/// Default quota for a `(tier, feature)` pair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LimitPolicy {
    pub tier: SubscriptionTier,
    pub feature: Feature,
    pub daily_limit: u32,
    pub hourly_limit: u32,
}

impl LimitPolicy {
    pub fn new(
        tier: SubscriptionTier,
        feature: Feature,
        daily_limit: u32,
        hourly_limit: u32,
    ) -> Self {
        Self {
            tier,
            feature,
            daily_limit,
            hourly_limit,
        }
    }

    /// The catalogue used when a deployment configures no policies of its own.
    pub fn builtin_defaults() -> Vec<LimitPolicy> {
        let mut policies = Vec::new();
        for feature in Feature::iter() {
            let (free_daily, free_hourly) = match feature {
                Feature::ResumeAnalysis => (2, 1),
                Feature::CareerAdvice => (5, 2),
                _ => (3, 1),
            };
            policies.push(LimitPolicy::new(
                SubscriptionTier::Free,
                feature,
                free_daily,
                free_hourly,
            ));
            policies.push(LimitPolicy::new(SubscriptionTier::Pro, feature, 20, 5));
            policies.push(LimitPolicy::new(SubscriptionTier::AiCoach, feature, 50, 10));
        }
        policies
    }
}

/// A per-user exception that replaces the tier default while it is active.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LimitOverride {
    pub user_id: String,
    pub feature: Feature,
    pub daily_limit: u32,
    pub hourly_limit: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl LimitOverride {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// One immutable row of the usage log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub feature: Feature,
    pub used_at: DateTime<Utc>,
    pub success: bool,
    pub metadata: Option<Value>,
}

impl UsageRecord {
    pub fn new(
        user_id: String,
        feature: Feature,
        used_at: DateTime<Utc>,
        success: bool,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            feature,
            used_at,
            success,
            metadata,
        }
    }
}
