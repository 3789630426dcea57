pub mod migration_trait;
pub mod migrations;

use sqlx::PgPool;

use crate::error::{Error, ErrorDetails};
use migration_trait::Migration;
use migrations::migration_0000::Migration0000;
use migrations::migration_0001::Migration0001;

/// Applies every pending migration in order.
pub async fn run(pool: &PgPool) -> Result<(), Error> {
    let migrations: [Box<dyn Migration + Send + Sync + '_>; 2] = [
        Box::new(Migration0000 { pool }),
        Box::new(Migration0001 { pool }),
    ];
    let clean_start = !migrations::check_table_exists(pool, "ai_feature_limits", "0000").await?;
    for migration in migrations {
        run_migration(migration.as_ref(), clean_start).await?;
    }
    Ok(())
}

async fn run_migration(
    migration: &(dyn Migration + Send + Sync),
    clean_start: bool,
) -> Result<(), Error> {
    migration.can_apply().await?;
    if !migration.should_apply().await? {
        tracing::debug!("Skipping Postgres migration {}", migration.name());
        return Ok(());
    }
    tracing::info!("Applying Postgres migration {}", migration.name());
    if let Err(e) = migration.apply(clean_start).await {
        tracing::error!(
            "Failed to apply migration {}. Rollback with:\n{}",
            migration.name(),
            migration.rollback_instructions()
        );
        return Err(e);
    }
    if !migration.has_succeeded().await? {
        return Err(Error::new(ErrorDetails::PostgresMigration {
            id: migration.name(),
            message: "migration ran but its tables are still missing".to_string(),
        }));
    }
    tracing::info!("Applied Postgres migration {}", migration.name());
    Ok(())
}
