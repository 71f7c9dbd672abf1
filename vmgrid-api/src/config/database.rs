use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;
use vmgrid_orchestrator::migrations::run_inline_migrations;

/// Connects the record mirror database and applies its schema.
pub async fn create_pool(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    run_inline_migrations(&pool).await?;
    Ok(pool)
}
