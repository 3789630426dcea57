use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::LimitPolicyQueries;
use crate::error::Error;
use crate::types::{Feature, LimitOverride, LimitPolicy, SubscriptionTier};

/// Tier defaults taken from configuration, for deployments without Postgres.
/// Overrides live only in the database, so none are ever found here.
#[derive(Clone, Debug, Default)]
pub struct StaticLimitPolicies {
    policies: HashMap<(SubscriptionTier, Feature), LimitPolicy>,
}

impl StaticLimitPolicies {
    pub fn new(policies: impl IntoIterator<Item = LimitPolicy>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|p| ((p.tier, p.feature), p))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[async_trait]
impl LimitPolicyQueries for StaticLimitPolicies {
    async fn get_active_override(
        &self,
        _user_id: &str,
        _feature: Feature,
        _now: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, Error> {
        Ok(None)
    }

    async fn get_tier_policy(
        &self,
        tier: SubscriptionTier,
        feature: Feature,
    ) -> Result<Option<LimitPolicy>, Error> {
        Ok(self.policies.get(&(tier, feature)).cloned())
    }

    async fn upsert_tier_policy_if_absent(&self, _policy: &LimitPolicy) -> Result<bool, Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_policies_answer_from_catalogue() {
        let store = StaticLimitPolicies::new(LimitPolicy::builtin_defaults());
        assert_eq!(store.len(), 15);

        let policy = store
            .get_tier_policy(SubscriptionTier::Pro, Feature::JobFitAnalysis)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((policy.daily_limit, policy.hourly_limit), (20, 5));

        let no_override = store
            .get_active_override("user-1", Feature::JobFitAnalysis, Utc::now())
            .await
            .unwrap();
        assert!(no_override.is_none());
    }

    #[tokio::test]
    async fn test_missing_combination_is_none() {
        let store = StaticLimitPolicies::new([LimitPolicy::new(
            SubscriptionTier::Free,
            Feature::ResumeAnalysis,
            2,
            1,
        )]);
        let missing = store
            .get_tier_policy(SubscriptionTier::Free, Feature::CoverLetter)
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
