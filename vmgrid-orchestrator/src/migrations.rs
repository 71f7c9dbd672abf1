use anyhow::Context;
use sqlx::{Pool, Postgres};

/// Idempotent schema for the record mirror. Each entry is one statement.
const SCHEMA: &[&str] = &[
    r#"DO $$ BEGIN
        CREATE TYPE instance_state AS ENUM ('pending', 'running', 'failed', 'terminating', 'terminated');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$"#,
    r#"CREATE TABLE IF NOT EXISTS vmgrid_instances (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        ami TEXT NOT NULL,
        instance_type TEXT NOT NULL,
        storage_gb BIGINT NOT NULL CHECK (storage_gb >= 1),
        backend_used TEXT NOT NULL,
        backend_instance_id TEXT NOT NULL,
        state instance_state NOT NULL,
        public_ip TEXT,
        ssh_string TEXT,
        error_code TEXT,
        error_message TEXT,
        revision BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        terminated_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        CHECK (ssh_string IS NULL OR public_ip IS NOT NULL)
    )"#,
    "CREATE INDEX IF NOT EXISTS vmgrid_instances_created_at_idx ON vmgrid_instances (created_at)",
    "CREATE INDEX IF NOT EXISTS vmgrid_instances_state_idx ON vmgrid_instances (state)",
];

pub async fn run_inline_migrations(pool: &Pool<Postgres>) -> anyhow::Result<()> {
    tracing::info!("running inline migrations");
    for (i, statement) in SCHEMA.iter().enumerate() {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("migration statement {} failed", i + 1))?;
    }
    tracing::info!(statements = SCHEMA.len(), "migrations applied");
    Ok(())
}
