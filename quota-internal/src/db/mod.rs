//! Durable storage for quota policies, per-user overrides and the usage log.
//!
//! Every store is reached through the query traits below so that the limiter,
//! recorder and aggregator can run against Postgres, the in-memory mock, or the
//! statically configured catalogue without knowing which one they talk to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::types::{Feature, LimitOverride, LimitPolicy, SubscriptionTier, UsageRecord};

pub mod migration_manager;
pub mod mock;
pub mod postgres;
pub mod static_policies;

#[async_trait]
pub trait LimitPolicyQueries: Send + Sync {
    /// Most recently created override for `(user_id, feature)` that has not expired at `now`.
    async fn get_active_override(
        &self,
        user_id: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, Error>;

    async fn get_tier_policy(
        &self,
        tier: SubscriptionTier,
        feature: Feature,
    ) -> Result<Option<LimitPolicy>, Error>;

    /// Returns `true` if the policy was written, `false` if a row already existed.
    async fn upsert_tier_policy_if_absent(&self, policy: &LimitPolicy) -> Result<bool, Error>;
}

/// Successful usage inside a time range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UsageCount {
    pub count: u64,
    /// Timestamp of the oldest counted row; `None` when nothing was counted
    pub oldest: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UsageLogQueries: Send + Sync {
    async fn insert_usage_record(&self, record: &UsageRecord) -> Result<(), Error>;

    /// Counts rows with `success = true` and `since <= used_at <= until`.
    async fn count_successful_usage(
        &self,
        user_id: &str,
        feature: Feature,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UsageCount, Error>;

    async fn health(&self) -> Result<(), Error>;
}
