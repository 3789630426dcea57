use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tokio::time::timeout;

use crate::counter::{CounterBackends, CounterKey};
use crate::error::{Error, ErrorDetails};
use crate::policy::{LimitPolicyStore, LimitSource};
use crate::rate_limit::serialize_optional_reset;
use crate::types::{Feature, SubscriptionTier, WindowKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ResetTimes {
    #[serde(serialize_with = "serialize_optional_reset")]
    pub hourly: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_optional_reset")]
    pub daily: Option<DateTime<Utc>>,
}

/// Read-only usage summary for one feature.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub feature: Feature,
    pub hourly_used: u64,
    pub hourly_limit: u32,
    pub hourly_remaining: u64,
    pub daily_used: u64,
    pub daily_limit: u32,
    pub daily_remaining: u64,
    pub reset_at: ResetTimes,
    /// `None` when the tier has no access to the feature
    pub limit_source: Option<LimitSource>,
}

/// Builds [`UsageStats`] from the same counters the limiter reads, without incrementing anything.
#[derive(Clone, Debug)]
pub struct UsageStatsAggregator {
    policies: LimitPolicyStore,
    counters: CounterBackends,
    stats_timeout: Duration,
}

impl UsageStatsAggregator {
    pub fn new(
        policies: LimitPolicyStore,
        counters: CounterBackends,
        stats_timeout: Duration,
    ) -> Self {
        Self {
            policies,
            counters,
            stats_timeout,
        }
    }

    pub async fn stats_for(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
    ) -> Result<UsageStats, Error> {
        self.stats_for_at(user_id, feature, tier, Utc::now()).await
    }

    pub async fn stats_for_at(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<UsageStats, Error> {
        timeout(self.stats_timeout, self.collect(user_id, feature, tier, now))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::BackendTimeout {
                    backend: "usage_stats".to_string(),
                    timeout_ms: u64::try_from(self.stats_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            })?
    }

    /// One entry per known feature, in declaration order.
    pub async fn all_stats(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
    ) -> Result<Vec<UsageStats>, Error> {
        self.all_stats_at(user_id, tier, Utc::now()).await
    }

    pub async fn all_stats_at(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageStats>, Error> {
        try_join_all(Feature::all().map(|feature| self.stats_for_at(user_id, feature, tier, now)))
            .await
    }

    async fn collect(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<UsageStats, Error> {
        let hourly_key = CounterKey::new(user_id, feature, WindowKind::Hourly);
        let daily_key = CounterKey::new(user_id, feature, WindowKind::Daily);
        let (limits, hourly, daily) = tokio::try_join!(
            self.policies.resolve(user_id, feature, tier, now),
            self.counters.read(&hourly_key, now),
            self.counters.read(&daily_key, now),
        )?;

        let (hourly_limit, daily_limit, limit_source) = match limits {
            Some(l) => (l.hourly_limit, l.daily_limit, Some(l.source)),
            None => (0, 0, None),
        };
        let hourly_reset = match (hourly.resets_at, daily.resets_at) {
            (Some(h), Some(d)) => Some(h.min(d)),
            (h, _) => h,
        };

        Ok(UsageStats {
            feature,
            hourly_used: hourly.count,
            hourly_limit,
            hourly_remaining: u64::from(hourly_limit).saturating_sub(hourly.count),
            daily_used: daily.count,
            daily_limit,
            daily_remaining: u64::from(daily_limit).saturating_sub(daily.count),
            reset_at: ResetTimes {
                hourly: hourly_reset,
                daily: daily.resets_at,
            },
            limit_source,
        })
    }
}
