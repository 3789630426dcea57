use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::LimitPolicyQueries;
use crate::error::Error;
use crate::types::{Feature, LimitPolicy, SubscriptionTier};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LimitSource {
    Override {
        #[serde(rename = "expiresAt")]
        expires_at: Option<DateTime<Utc>>,
    },
    TierDefault,
}

/// The (hourly, daily) limit pair in force for one user and feature.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLimits {
    pub hourly_limit: u32,
    pub daily_limit: u32,
    pub source: LimitSource,
}

/// Resolves effective limits: an active per-user override replaces the tier default outright.
#[derive(Clone)]
pub struct LimitPolicyStore {
    queries: Arc<dyn LimitPolicyQueries>,
}

impl std::fmt::Debug for LimitPolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitPolicyStore")
            .field("queries", &"<dyn LimitPolicyQueries>")
            .finish()
    }
}

impl LimitPolicyStore {
    pub fn new(queries: Arc<dyn LimitPolicyQueries>) -> Self {
        Self { queries }
    }

    /// `Ok(None)` means the tier has no access to the feature.
    pub async fn resolve(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<Option<ResolvedLimits>, Error> {
        let active_override = self
            .queries
            .get_active_override(user_id, feature, now)
            .await?
            .filter(|o| o.is_active_at(now));
        if let Some(o) = active_override {
            return Ok(Some(ResolvedLimits {
                hourly_limit: o.hourly_limit,
                daily_limit: o.daily_limit,
                source: LimitSource::Override {
                    expires_at: o.expires_at,
                },
            }));
        }

        let policy = self.queries.get_tier_policy(tier, feature).await?;
        Ok(policy.map(|p| ResolvedLimits {
            hourly_limit: p.hourly_limit,
            daily_limit: p.daily_limit,
            source: LimitSource::TierDefault,
        }))
    }

    /// Writes each policy that is not already stored. Returns how many were written.
    pub async fn seed(&self, policies: &[LimitPolicy]) -> Result<usize, Error> {
        let mut written = 0;
        for policy in policies {
            if self.queries.upsert_tier_policy_if_absent(policy).await? {
                written += 1;
            }
        }
        Ok(written)
    }
}
