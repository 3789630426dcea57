use async_trait::async_trait;
use sqlx::PgPool;

use super::{check_table_exists, execute};
use crate::db::migration_manager::migration_trait::Migration;
use crate::error::Error;

/// Creates the policy tables: tier defaults in `ai_feature_limits` and
/// per-user exceptions in `ai_user_limit_overrides`.
pub struct Migration0000<'a> {
    pub pool: &'a PgPool,
}

const MIGRATION_ID: &str = "0000";

#[async_trait]
impl Migration for Migration0000<'_> {
    async fn can_apply(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn should_apply(&self) -> Result<bool, Error> {
        let limits_exist = check_table_exists(self.pool, "ai_feature_limits", MIGRATION_ID).await?;
        let overrides_exist =
            check_table_exists(self.pool, "ai_user_limit_overrides", MIGRATION_ID).await?;
        Ok(!limits_exist || !overrides_exist)
    }

    async fn apply(&self, _clean_start: bool) -> Result<(), Error> {
        execute(
            self.pool,
            r#"
            CREATE TABLE IF NOT EXISTS ai_feature_limits (
                feature TEXT NOT NULL,
                tier TEXT NOT NULL,
                daily_limit INTEGER NOT NULL CHECK (daily_limit >= 0),
                hourly_limit INTEGER NOT NULL CHECK (hourly_limit >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (feature, tier)
            )
            "#,
            MIGRATION_ID,
        )
        .await?;

        execute(
            self.pool,
            r#"
            CREATE TABLE IF NOT EXISTS ai_user_limit_overrides (
                id BIGSERIAL PRIMARY KEY,
                user_id TEXT NOT NULL,
                feature TEXT NOT NULL,
                daily_limit INTEGER NOT NULL CHECK (daily_limit >= 0),
                hourly_limit INTEGER NOT NULL CHECK (hourly_limit >= 0),
                expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS ai_user_limit_overrides_user_feature_idx
                ON ai_user_limit_overrides (user_id, feature, created_at DESC)
            "#,
            MIGRATION_ID,
        )
        .await
    }

    fn rollback_instructions(&self) -> String {
        "DROP TABLE IF EXISTS ai_user_limit_overrides;\nDROP TABLE IF EXISTS ai_feature_limits;"
            .to_string()
    }

    async fn has_succeeded(&self) -> Result<bool, Error> {
        let should_apply = self.should_apply().await?;
        Ok(!should_apply)
    }
}
