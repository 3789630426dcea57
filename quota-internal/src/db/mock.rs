use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{LimitPolicyQueries, UsageCount, UsageLogQueries};
use crate::error::{Error, ErrorDetails};
use crate::types::{Feature, LimitOverride, LimitPolicy, SubscriptionTier, UsageRecord};

/// In-memory stand-in for the Postgres schema, used in tests and local development.
///
/// Flipping `healthy` off makes every query fail the same way an unreachable database would.
#[derive(Debug)]
pub struct MockDatabase {
    healthy: AtomicBool,
    policies: RwLock<HashMap<(SubscriptionTier, Feature), LimitPolicy>>,
    overrides: RwLock<Vec<LimitOverride>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MockDatabase {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            policies: RwLock::new(HashMap::new()),
            overrides: RwLock::new(Vec::new()),
            usage: RwLock::new(Vec::new()),
        }
    }

    pub async fn with_policies(policies: impl IntoIterator<Item = LimitPolicy>) -> Self {
        let db = Self::new(true);
        {
            let mut stored = db.policies.write().await;
            for policy in policies {
                stored.insert((policy.tier, policy.feature), policy);
            }
        }
        db
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn insert_override(&self, limit_override: LimitOverride) {
        self.overrides.write().await.push(limit_override);
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }

    fn ensure_healthy(&self) -> Result<(), Error> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::BackendUnavailable {
                backend: "postgres".to_string(),
                message: "mock database is marked unhealthy".to_string(),
            }))
        }
    }
}

#[async_trait]
impl LimitPolicyQueries for MockDatabase {
    async fn get_active_override(
        &self,
        user_id: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, Error> {
        self.ensure_healthy()?;
        let overrides = self.overrides.read().await;
        Ok(overrides
            .iter()
            .filter(|o| o.user_id == user_id && o.feature == feature && o.is_active_at(now))
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn get_tier_policy(
        &self,
        tier: SubscriptionTier,
        feature: Feature,
    ) -> Result<Option<LimitPolicy>, Error> {
        self.ensure_healthy()?;
        Ok(self.policies.read().await.get(&(tier, feature)).cloned())
    }

    async fn upsert_tier_policy_if_absent(&self, policy: &LimitPolicy) -> Result<bool, Error> {
        self.ensure_healthy()?;
        let mut policies = self.policies.write().await;
        let key = (policy.tier, policy.feature);
        if policies.contains_key(&key) {
            return Ok(false);
        }
        policies.insert(key, policy.clone());
        Ok(true)
    }
}

#[async_trait]
impl UsageLogQueries for MockDatabase {
    async fn insert_usage_record(&self, record: &UsageRecord) -> Result<(), Error> {
        self.ensure_healthy()?;
        self.usage.write().await.push(record.clone());
        Ok(())
    }

    async fn count_successful_usage(
        &self,
        user_id: &str,
        feature: Feature,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UsageCount, Error> {
        self.ensure_healthy()?;
        let usage = self.usage.read().await;
        let mut result = UsageCount::default();
        for record in usage.iter().filter(|r| {
            r.success
                && r.user_id == user_id
                && r.feature == feature
                && r.used_at >= since
                && r.used_at <= until
        }) {
            result.count += 1;
            result.oldest = Some(match result.oldest {
                Some(oldest) => oldest.min(record.used_at),
                None => record.used_at,
            });
        }
        Ok(result)
    }

    async fn health(&self) -> Result<(), Error> {
        self.ensure_healthy()
    }
}
