//! Postgres job store
//!
//! Records live in `jobs` (full record as JSONB plus filter columns), the
//! audit trail in `job_audit`. A write runs in one transaction: lock the
//! row, check the revision, upsert, append the audit row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::JobId;
use keel_core::domain::job::{AuditEntry, JobRecord, TransitionEvent};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{JobFilter, JobStore, ListCursor, appended_event, check_revision};
use crate::error::{Result, SchedulerError};

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn put(&self, mut record: JobRecord) -> Result<JobRecord> {
        let job_id = record.id();
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT record FROM jobs WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.record.0);

        check_revision(
            job_id,
            previous.as_ref().map(|r| r.revision),
            record.revision,
        )?;

        let event = appended_event(previous.as_ref(), &record);
        record.revision += 1;
        let revision = to_db_revision(record.revision)?;

        // A concurrent first insert shows up as zero affected rows
        let written = sqlx::query(
            r#"
            INSERT INTO jobs (id, phase, submitter, namespace, submitted_at, updated_at, revision, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET phase = EXCLUDED.phase, updated_at = EXCLUDED.updated_at,
                revision = EXCLUDED.revision, record = EXCLUDED.record
            WHERE jobs.revision = $7 - 1
            "#,
        )
        .bind(job_id)
        .bind(record.phase.to_string())
        .bind(&record.spec.submitter)
        .bind(&record.spec.namespace)
        .bind(record.submitted_at)
        .bind(record.updated_at)
        .bind(revision)
        .bind(Json(&record))
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 0 {
            return Err(SchedulerError::StoreWriteConflict {
                job_id,
                expected: record.revision - 1,
                found: record.revision,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO job_audit (job_id, revision, recorded_at, event, record)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(revision)
        .bind(Utc::now())
        .bind(event.as_ref().map(Json))
        .bind(Json(&record))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(record)
    }

    async fn get(&self, job_id: JobId) -> Result<JobRecord> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT record FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.record.0)
            .ok_or(SchedulerError::NotFound(job_id))
    }

    async fn list(
        &self,
        filter: &JobFilter,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT record FROM jobs WHERE TRUE");

        if let Some(phase) = filter.phase {
            query.push(" AND phase = ").push_bind(phase.to_string());
        }
        if let Some(submitter) = &filter.submitter {
            query.push(" AND submitter = ").push_bind(submitter.clone());
        }
        if let Some(namespace) = &filter.namespace {
            query.push(" AND namespace = ").push_bind(namespace.clone());
        }
        if let Some(since) = filter.since {
            query.push(" AND submitted_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            query.push(" AND submitted_at < ").push_bind(until);
        }
        if let Some(cursor) = after {
            query
                .push(" AND (submitted_at, id) > (")
                .push_bind(cursor.submitted_at)
                .push(", ")
                .push_bind(cursor.id)
                .push(")");
        }

        query
            .push(" ORDER BY submitted_at ASC, id ASC LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = query
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.record.0).collect())
    }

    async fn history(&self, job_id: JobId) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT seq, job_id, revision, recorded_at, event, record
            FROM job_audit
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(SchedulerError::NotFound(job_id));
        }

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn to_db_revision(revision: u64) -> Result<i64> {
    i64::try_from(revision).map_err(|_| SchedulerError::Store(format!("revision {} overflows", revision)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RecordRow {
    record: Json<JobRecord>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    seq: i64,
    job_id: Uuid,
    revision: i64,
    recorded_at: DateTime<Utc>,
    event: Option<Json<TransitionEvent>>,
    record: Json<JobRecord>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        AuditEntry {
            seq: row.seq as u64,
            job_id: row.job_id,
            revision: row.revision as u64,
            recorded_at: row.recorded_at,
            event: row.event.map(|e| e.0),
            record: row.record.0,
        }
    }
}
