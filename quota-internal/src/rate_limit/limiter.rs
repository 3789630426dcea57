use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{DecisionOutcome, RateLimitDecision};
use crate::config_parser::QuotaConfig;
use crate::counter::{CounterBackends, CounterKey, WindowUsage};
use crate::error::Error;
use crate::observability::QuotaMetrics;
use crate::policy::{LimitPolicyStore, ResolvedLimits};
use crate::types::{Feature, SubscriptionTier, WindowKind};

/// How long a caller is told to wait when the check failed closed.
const FAIL_CLOSED_RETRY: TimeDelta = TimeDelta::seconds(60);

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Upper bound on policy resolution plus both counter reads
    pub check_timeout: Duration,
    /// Whether to allow (fail open) or deny (fail closed) when the stores cannot answer
    pub fail_open: bool,
    /// Limit and remaining reported on a fail-open decision
    pub placeholder_limit: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_millis(300),
            fail_open: true,
            placeholder_limit: 1000,
        }
    }
}

impl From<&QuotaConfig> for RateLimiterConfig {
    fn from(config: &QuotaConfig) -> Self {
        Self {
            check_timeout: config.check_timeout(),
            fail_open: config.fail_open,
            placeholder_limit: config.fail_open_placeholder_limit,
        }
    }
}

/// Answers "may this call proceed?" from the resolved limits and both window counters.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    policies: LimitPolicyStore,
    counters: CounterBackends,
    config: RateLimiterConfig,
    metrics: Arc<QuotaMetrics>,
}

impl RateLimiter {
    pub fn new(
        policies: LimitPolicyStore,
        counters: CounterBackends,
        config: RateLimiterConfig,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        Self {
            policies,
            counters,
            config,
            metrics,
        }
    }

    pub async fn check(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
    ) -> RateLimitDecision {
        self.check_at(user_id, feature, tier, Utc::now()).await
    }

    /// Never fails: store errors and timeouts become a fail-open (or fail-closed) decision.
    pub async fn check_at(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let result = timeout(
            self.config.check_timeout,
            self.evaluate(user_id, feature, tier, now),
        )
        .await;

        let decision = match result {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                let reason = if e.is_backend_failure() {
                    "backend_error"
                } else {
                    "internal_error"
                };
                self.on_failure(feature, reason, &e.to_string(), now)
            }
            Err(_) => self.on_failure(
                feature,
                "timeout",
                &format!(
                    "check did not finish within {}ms",
                    self.config.check_timeout.as_millis()
                ),
                now,
            ),
        };

        self.metrics.record_check(decision.outcome);
        match decision.outcome {
            DecisionOutcome::DeniedHourly
            | DecisionOutcome::DeniedDaily
            | DecisionOutcome::DeniedNoPolicy => {
                info!(
                    feature = feature.as_ref(),
                    tier = tier.as_ref(),
                    outcome = decision.outcome.as_str(),
                    limit = decision.limit,
                    retry_after_seconds = decision.retry_after_seconds,
                    "Quota check denied"
                );
            }
            DecisionOutcome::Allowed => {
                debug!(
                    feature = feature.as_ref(),
                    limit = decision.limit,
                    remaining = decision.remaining,
                    "Quota check allowed"
                );
            }
            DecisionOutcome::FailOpen | DecisionOutcome::FailClosed => {}
        }
        decision
    }

    async fn evaluate(
        &self,
        user_id: &str,
        feature: Feature,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, Error> {
        let Some(limits) = self.policies.resolve(user_id, feature, tier, now).await? else {
            return Ok(no_policy_decision(now));
        };
        let hourly_key = CounterKey::new(user_id, feature, WindowKind::Hourly);
        let daily_key = CounterKey::new(user_id, feature, WindowKind::Daily);
        let (hourly, daily) = tokio::try_join!(
            self.counters.read(&hourly_key, now),
            self.counters.read(&daily_key, now)
        )?;
        Ok(decide(&limits, hourly, daily, now))
    }

    fn on_failure(
        &self,
        feature: Feature,
        reason: &'static str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if self.config.fail_open {
            // Never include the user id in this line.
            warn!(
                quota.fail_open = true,
                reason,
                feature = feature.as_ref(),
                "Quota check failed open: {detail}"
            );
            self.metrics.record_fail_open(reason);
            RateLimitDecision {
                allowed: true,
                limit: self.config.placeholder_limit,
                remaining: self.config.placeholder_limit,
                reset_at: now + WindowKind::Hourly.duration(),
                retry_after_seconds: None,
                outcome: DecisionOutcome::FailOpen,
            }
        } else {
            warn!(
                quota.fail_open = false,
                reason,
                feature = feature.as_ref(),
                "Quota check failed closed: {detail}"
            );
            let reset_at = now + FAIL_CLOSED_RETRY;
            RateLimitDecision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at,
                retry_after_seconds: Some(retry_after_seconds(reset_at, now)),
                outcome: DecisionOutcome::FailClosed,
            }
        }
    }
}

/// Whole seconds until `reset_at`, rounded up and never below one.
pub fn retry_after_seconds(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds();
    let seconds = (millis + 999).div_euclid(1000);
    u64::try_from(seconds).unwrap_or(0).max(1)
}

/// Reset times for both windows, defaulting to a full window from `now` when the
/// counter is empty, with the hourly reset never after the daily one.
pub fn window_resets(
    hourly: &WindowUsage,
    daily: &WindowUsage,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let daily_reset = daily
        .resets_at
        .unwrap_or_else(|| now + WindowKind::Daily.duration());
    let hourly_reset = hourly
        .resets_at
        .unwrap_or_else(|| now + WindowKind::Hourly.duration())
        .min(daily_reset);
    (hourly_reset, daily_reset)
}

fn no_policy_decision(now: DateTime<Utc>) -> RateLimitDecision {
    let reset_at = now + WindowKind::Daily.duration();
    RateLimitDecision {
        allowed: false,
        limit: 0,
        remaining: 0,
        reset_at,
        retry_after_seconds: Some(retry_after_seconds(reset_at, now)),
        outcome: DecisionOutcome::DeniedNoPolicy,
    }
}

fn denied(
    outcome: DecisionOutcome,
    limit: u32,
    reset_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RateLimitDecision {
    RateLimitDecision {
        allowed: false,
        limit,
        remaining: 0,
        reset_at,
        retry_after_seconds: Some(retry_after_seconds(reset_at, now)),
        outcome,
    }
}

/// The decision for one check given current counts.
///
/// When both windows are exhausted the daily one is reported, since it lifts last.
/// On an allow, `remaining` already accounts for the call being admitted, and the
/// reported limit is that of whichever window has less room left.
pub fn decide(
    limits: &ResolvedLimits,
    hourly: WindowUsage,
    daily: WindowUsage,
    now: DateTime<Utc>,
) -> RateLimitDecision {
    let (hourly_reset, daily_reset) = window_resets(&hourly, &daily, now);
    let hourly_limit = u64::from(limits.hourly_limit);
    let daily_limit = u64::from(limits.daily_limit);

    if daily.count >= daily_limit {
        return denied(
            DecisionOutcome::DeniedDaily,
            limits.daily_limit,
            daily_reset,
            now,
        );
    }
    if hourly.count >= hourly_limit {
        return denied(
            DecisionOutcome::DeniedHourly,
            limits.hourly_limit,
            hourly_reset,
            now,
        );
    }

    let hourly_left = hourly_limit - hourly.count - 1;
    let daily_left = daily_limit - daily.count - 1;
    let (limit, remaining) = if hourly_left <= daily_left {
        (limits.hourly_limit, hourly_left)
    } else {
        (limits.daily_limit, daily_left)
    };
    RateLimitDecision {
        allowed: true,
        limit,
        remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
        reset_at: hourly_reset,
        retry_after_seconds: None,
        outcome: DecisionOutcome::Allowed,
    }
}
