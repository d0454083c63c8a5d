use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

/// Open the record store pool and make sure Postgres answers before the
/// monitors start relying on it.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}
