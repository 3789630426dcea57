use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config_parser::QuotaConfig;
use crate::counter::{CounterBackendKind, CounterBackends};
use crate::db::{LimitPolicyQueries, UsageLogQueries};
use crate::error::Error;
use crate::observability::{QuotaMetrics, QuotaMetricsSnapshot};
use crate::policy::LimitPolicyStore;
use crate::rate_limit::limiter::RateLimiterConfig;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::types::{Feature, SubscriptionTier};
use crate::usage::{UsageRecorder, UsageStats, UsageStatsAggregator};

/// Check, record and stats behind one cheaply cloneable handle.
#[derive(Clone, Debug)]
pub struct QuotaService {
    limiter: RateLimiter,
    recorder: UsageRecorder,
    stats: UsageStatsAggregator,
    policies: LimitPolicyStore,
    counters: CounterBackends,
    metrics: Arc<QuotaMetrics>,
}

impl QuotaService {
    pub fn new(
        policy_queries: Arc<dyn LimitPolicyQueries>,
        usage_log: Arc<dyn UsageLogQueries>,
        counters: CounterBackends,
        config: &QuotaConfig,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        let policies = LimitPolicyStore::new(policy_queries);
        let limiter = RateLimiter::new(
            policies.clone(),
            counters.clone(),
            RateLimiterConfig::from(config),
            metrics.clone(),
        );
        let recorder = UsageRecorder::new(
            usage_log,
            counters.clone(),
            config.record_timeout(),
            metrics.clone(),
        );
        let stats =
            UsageStatsAggregator::new(policies.clone(), counters.clone(), config.check_timeout());
        Self {
            limiter,
            recorder,
            stats,
            policies,
            counters,
            metrics,
        }
    }

    pub async fn check(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
    ) -> RateLimitDecision {
        self.limiter.check(user_id, feature, tier).await
    }

    pub async fn check_at(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.limiter.check_at(user_id, feature, tier, now).await
    }

    pub async fn record(
        &self,
        user_id: &str,
        feature: Feature,
        success: bool,
        metadata: Option<Value>,
    ) {
        self.recorder.record(user_id, feature, success, metadata).await;
    }

    pub async fn record_at(
        &self,
        user_id: &str,
        feature: Feature,
        success: bool,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) {
        self.recorder
            .record_at(user_id, feature, success, metadata, now)
            .await;
    }

    pub async fn stats_for(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
    ) -> Result<UsageStats, Error> {
        self.stats.stats_for(user_id, feature, tier).await
    }

    pub async fn all_stats(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
    ) -> Result<Vec<UsageStats>, Error> {
        self.stats.all_stats(user_id, tier).await
    }

    pub fn policies(&self) -> &LimitPolicyStore {
        &self.policies
    }

    pub fn active_backend(&self) -> CounterBackendKind {
        self.counters.active_kind()
    }

    pub fn metrics(&self) -> QuotaMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn health(&self) -> Result<(), Error> {
        self.counters.health().await
    }
}
