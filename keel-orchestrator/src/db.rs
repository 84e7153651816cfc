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
    // Current record per job; the full record is kept as JSON, the columns
    // exist for filtering and ordering
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            phase VARCHAR(32) NOT NULL,
            submitter VARCHAR(255),
            namespace VARCHAR(255),
            submitted_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            revision BIGINT NOT NULL,
            record JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only audit log, one row per successful write
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_audit (
            seq BIGSERIAL PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            revision BIGINT NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL,
            event JSONB,
            record JSONB NOT NULL,
            UNIQUE (job_id, revision)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Listing order and common filters
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_submitted ON jobs(submitted_at, id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_phase ON jobs(phase)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_namespace ON jobs(namespace)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_audit_job_id ON job_audit(job_id, seq)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
