pub mod migration_0000;
pub mod migration_0001;

use sqlx::PgPool;

use crate::error::{Error, ErrorDetails};

pub async fn check_table_exists(
    pool: &PgPool,
    table: &str,
    migration_id: &str,
) -> Result<bool, Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1)",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        Error::new(ErrorDetails::PostgresMigration {
            id: migration_id.to_string(),
            message: format!("Failed to check whether table `{table}` exists: {e}"),
        })
    })
}

pub async fn check_index_exists(
    pool: &PgPool,
    index: &str,
    migration_id: &str,
) -> Result<bool, Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE schemaname = current_schema() AND indexname = $1)",
    )
    .bind(index)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        Error::new(ErrorDetails::PostgresMigration {
            id: migration_id.to_string(),
            message: format!("Failed to check whether index `{index}` exists: {e}"),
        })
    })
}

pub async fn execute(pool: &PgPool, query: &str, migration_id: &str) -> Result<(), Error> {
    sqlx::raw_sql(query).execute(pool).await.map_err(|e| {
        Error::new(ErrorDetails::PostgresMigration {
            id: migration_id.to_string(),
            message: e.to_string(),
        })
    })?;
    Ok(())
}
