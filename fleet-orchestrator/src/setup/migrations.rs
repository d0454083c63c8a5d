use sqlx::{Pool, Postgres};

/// Run database migrations and verify the tables the orchestrator needs exist.
pub async fn run_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    if let Err(e) = sqlx::migrate!("../sqlx-migrations").run(pool).await {
        tracing::warn!(
            "Migration error (may be safe to ignore if migrations were applied manually): {}",
            e
        );

        let tables_exist: bool = sqlx::query_scalar(
            "SELECT COUNT(*) = 3 FROM information_schema.tables
             WHERE table_name IN ('instances', 'generation_jobs', 'action_logs')",
        )
        .fetch_one(pool)
        .await
        .unwrap_or(false);

        if !tables_exist {
            tracing::error!("Critical tables are missing - migrations must be applied!");
            return Err(e);
        }

        tracing::info!("Critical tables exist - continuing despite migration error");
    }

    Ok(())
}
