use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Checkpoint is kept as text so malformed state can be detected and skipped
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            kind VARCHAR(50) NOT NULL,
            target_id VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            checkpoint TEXT,
            pause_reason VARCHAR(20),
            resume_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Claim fencing and leases
    sqlx::query(
        r#"
        ALTER TABLE jobs
            ADD COLUMN IF NOT EXISTS claim_token UUID,
            ADD COLUMN IF NOT EXISTS lease_expires_at TIMESTAMPTZ
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_target_id ON jobs(target_id)")
        .execute(pool)
        .await?;

    // Single-row table shared by every dispatcher
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dispatch_session (
            id SMALLINT PRIMARY KEY CHECK (id = 1),
            requests_this_session BIGINT NOT NULL DEFAULT 0,
            session_reset_time TIMESTAMPTZ,
            rate_limited_until TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO dispatch_session (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
