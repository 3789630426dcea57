use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use super::migration_manager;
use super::mock::MockDatabase;
use super::{LimitPolicyQueries, UsageCount, UsageLogQueries};
use crate::error::{Error, ErrorDetails};
use crate::types::{Feature, LimitOverride, LimitPolicy, SubscriptionTier, UsageRecord};

const POSTGRES_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const POSTGRES_MAX_CONNECTIONS: u32 = 20;

#[derive(Clone, Debug)]
pub enum PostgresConnectionInfo {
    Production { pool: PgPool },
    Mock(Arc<MockDatabase>),
    Disabled,
}

impl PostgresConnectionInfo {
    pub async fn new_with_url(url: &SecretString) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(POSTGRES_MAX_CONNECTIONS)
            .acquire_timeout(POSTGRES_ACQUIRE_TIMEOUT)
            .connect(url.expose_secret())
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresConnection {
                    message: e.to_string(),
                })
            })?;
        Ok(Self::Production { pool })
    }

    pub fn new_mock(healthy: bool) -> Self {
        Self::Mock(Arc::new(MockDatabase::new(healthy)))
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn get_pool(&self) -> Option<&PgPool> {
        match self {
            Self::Production { pool } => Some(pool),
            Self::Mock(_) | Self::Disabled => None,
        }
    }

    /// Creates the quota tables if they are missing. The mock needs no schema.
    pub async fn run_migrations(&self) -> Result<(), Error> {
        match self {
            Self::Production { pool } => migration_manager::run(pool).await,
            Self::Mock(_) | Self::Disabled => Ok(()),
        }
    }

    fn disabled_error() -> Error {
        Error::new(ErrorDetails::BackendUnavailable {
            backend: "postgres".to_string(),
            message: "Postgres is disabled; set `QUOTA_POSTGRES_URL` to enable it".to_string(),
        })
    }
}

fn query_error(e: sqlx::Error) -> Error {
    Error::new(ErrorDetails::PostgresQuery {
        message: e.to_string(),
    })
}

fn to_limit(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_db_limit(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl LimitPolicyQueries for PostgresConnectionInfo {
    async fn get_active_override(
        &self,
        user_id: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<Option<LimitOverride>, Error> {
        let pool = match self {
            Self::Production { pool } => pool,
            Self::Mock(db) => return db.get_active_override(user_id, feature, now).await,
            Self::Disabled => return Err(Self::disabled_error()),
        };
        let row = sqlx::query_as::<_, (i32, i32, Option<DateTime<Utc>>, DateTime<Utc>)>(
            r#"
            SELECT daily_limit, hourly_limit, expires_at, created_at
            FROM ai_user_limit_overrides
            WHERE user_id = $1
              AND feature = $2
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(feature.as_ref())
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(query_error)?;

        Ok(
            row.map(|(daily_limit, hourly_limit, expires_at, created_at)| LimitOverride {
                user_id: user_id.to_string(),
                feature,
                daily_limit: to_limit(daily_limit),
                hourly_limit: to_limit(hourly_limit),
                expires_at,
                created_at,
            }),
        )
    }

    async fn get_tier_policy(
        &self,
        tier: SubscriptionTier,
        feature: Feature,
    ) -> Result<Option<LimitPolicy>, Error> {
        let pool = match self {
            Self::Production { pool } => pool,
            Self::Mock(db) => return db.get_tier_policy(tier, feature).await,
            Self::Disabled => return Err(Self::disabled_error()),
        };
        let row = sqlx::query_as::<_, (i32, i32)>(
            "SELECT daily_limit, hourly_limit FROM ai_feature_limits WHERE feature = $1 AND tier = $2",
        )
        .bind(feature.as_ref())
        .bind(tier.as_ref())
        .fetch_optional(pool)
        .await
        .map_err(query_error)?;

        Ok(row.map(|(daily_limit, hourly_limit)| {
            LimitPolicy::new(tier, feature, to_limit(daily_limit), to_limit(hourly_limit))
        }))
    }

    async fn upsert_tier_policy_if_absent(&self, policy: &LimitPolicy) -> Result<bool, Error> {
        let pool = match self {
            Self::Production { pool } => pool,
            Self::Mock(db) => return db.upsert_tier_policy_if_absent(policy).await,
            Self::Disabled => return Err(Self::disabled_error()),
        };
        let result = sqlx::query(
            r#"
            INSERT INTO ai_feature_limits (feature, tier, daily_limit, hourly_limit)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (feature, tier) DO NOTHING
            "#,
        )
        .bind(policy.feature.as_ref())
        .bind(policy.tier.as_ref())
        .bind(to_db_limit(policy.daily_limit))
        .bind(to_db_limit(policy.hourly_limit))
        .execute(pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UsageLogQueries for PostgresConnectionInfo {
    async fn insert_usage_record(&self, record: &UsageRecord) -> Result<(), Error> {
        let pool = match self {
            Self::Production { pool } => pool,
            Self::Mock(db) => return db.insert_usage_record(record).await,
            Self::Disabled => {
                tracing::debug!("Postgres is disabled, skipping usage record insert");
                return Ok(());
            }
        };
        sqlx::query(
            r#"
            INSERT INTO ai_usage_tracking (id, user_id, feature, used_at, success, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(record.feature.as_ref())
        .bind(record.used_at)
        .bind(record.success)
        .bind(record.metadata.as_ref().map(Json))
        .execute(pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn count_successful_usage(
        &self,
        user_id: &str,
        feature: Feature,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UsageCount, Error> {
        let pool = match self {
            Self::Production { pool } => pool,
            Self::Mock(db) => {
                return db
                    .count_successful_usage(user_id, feature, since, until)
                    .await
            }
            Self::Disabled => return Err(Self::disabled_error()),
        };
        let (count, oldest) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            r#"
            SELECT COUNT(*), MIN(used_at)
            FROM ai_usage_tracking
            WHERE user_id = $1
              AND feature = $2
              AND success
              AND used_at >= $3
              AND used_at <= $4
            "#,
        )
        .bind(user_id)
        .bind(feature.as_ref())
        .bind(since)
        .bind(until)
        .fetch_one(pool)
        .await
        .map_err(query_error)?;

        Ok(UsageCount {
            count: u64::try_from(count).unwrap_or(0),
            oldest,
        })
    }

    async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Production { pool } => {
                sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        Error::new(ErrorDetails::PostgresConnection {
                            message: e.to_string(),
                        })
                    })?;
                Ok(())
            }
            Self::Mock(db) => db.health().await,
            Self::Disabled => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_rejects_reads_but_skips_inserts() {
        let postgres = PostgresConnectionInfo::new_disabled();
        assert!(!postgres.is_enabled());

        let err = postgres
            .get_tier_policy(SubscriptionTier::Free, Feature::CoverLetter)
            .await
            .unwrap_err();
        assert!(err.is_backend_failure());

        let now = Utc::now();
        let err = postgres
            .count_successful_usage("user-1", Feature::CoverLetter, now, now)
            .await
            .unwrap_err();
        assert!(err.is_backend_failure());

        postgres
            .insert_usage_record(&UsageRecord::new(
                "user-1".to_string(),
                Feature::CoverLetter,
                now,
                true,
                None,
            ))
            .await
            .unwrap();
        postgres.health().await.unwrap();
        postgres.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_variant_delegates_to_mock_database() {
        let postgres = PostgresConnectionInfo::new_mock(true);
        assert!(postgres.is_enabled());
        assert!(postgres.get_pool().is_none());

        let now = Utc::now();
        postgres
            .insert_usage_record(&UsageRecord::new(
                "user-1".to_string(),
                Feature::CareerAdvice,
                now,
                true,
                Some(serde_json::json!({"model": "gpt-4o-mini"})),
            ))
            .await
            .unwrap();
        let count = postgres
            .count_successful_usage(
                "user-1",
                Feature::CareerAdvice,
                now - chrono::TimeDelta::hours(1),
                now,
            )
            .await
            .unwrap();
        assert_eq!(count.count, 1);
    }

    #[test]
    fn test_limit_conversions_saturate() {
        assert_eq!(to_limit(-3), 0);
        assert_eq!(to_limit(7), 7);
        assert_eq!(to_db_limit(u32::MAX), i32::MAX);
    }
}
