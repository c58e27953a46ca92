//! Job repository for PostgreSQL with SELECT FOR UPDATE SKIP LOCKED.
//!
//! Implements the [`JobQueue`] trait for persistent job storage with safe
//! concurrent job claiming using PostgreSQL's row-level locking.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use gleaner_core::JobResult;
use gleaner_core::error::AppError;
use gleaner_core::job::{CreateJobRequest, HarvestJob, JobStatus, RetryConfig};
use gleaner_core::job_queue::JobQueue;

/// PostgreSQL implementation of the job queue.
///
/// Uses `SELECT FOR UPDATE SKIP LOCKED` for safe concurrent job claiming,
/// ensuring that multiple workers can process jobs without conflicts.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    /// Create a new job repository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source_url: String,
    source_name: Option<String>,
    source_type: String,
    filter: Option<String>,
    disable_ssl_verification: bool,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result: Option<Json<JobResult>>,
    worker_id: Option<String>,
}

impl TryFrom<JobRow> for HarvestJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            source_url: row.source_url,
            source_name: row.source_name,
            source_type: row.source_type.parse()?,
            filter: row.filter,
            disable_ssl_verification: row.disable_ssl_verification,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            result: row.result.map(|json| json.0),
            worker_id: row.worker_id,
        })
    }
}

fn result_json(result: Option<&JobResult>) -> Result<Option<serde_json::Value>, AppError> {
    Ok(result.map(serde_json::to_value).transpose()?)
}

// =============================================================================
// JobQueue Trait Implementation
// =============================================================================

impl JobQueue for JobRepository {
    async fn create_job(&self, request: CreateJobRequest) -> Result<HarvestJob, AppError> {
        let max_retries = request
            .max_retries
            .unwrap_or(RetryConfig::default().max_retries) as i32;
        let source = request.source;

        let row: JobRow = sqlx::query_as(
            r#"
            INSERT INTO harvest_jobs
                (source_url, source_name, source_type, filter, disable_ssl_verification, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&source.url)
        .bind(&source.name)
        .bind(source.source_type.as_str())
        .bind(&source.filter)
        .bind(source.disable_ssl_verification)
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<HarvestJob>, AppError> {
        // Runnable: pending and either never failed or past its retry time.
        // Fresh jobs go before retries, then oldest first.
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE harvest_jobs
            SET
                status = 'running',
                worker_id = $1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM harvest_jobs
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY
                    next_retry_at NULLS FIRST,
                    created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(HarvestJob::try_from).transpose()
    }

    async fn complete_job(&self, job_id: Uuid, result: &JobResult) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE harvest_jobs
            SET
                status = 'completed',
                completed_at = NOW(),
                updated_at = NOW(),
                result = $2,
                error_message = NULL,
                next_retry_at = NULL,
                worker_id = NULL
            WHERE id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(job_id)
        .bind(serde_json::to_value(result)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        result: Option<&JobResult>,
    ) -> Result<(), AppError> {
        let (new_status, should_increment) = if next_retry_at.is_some() {
            ("pending", true)
        } else {
            ("failed", false)
        };

        sqlx::query(
            r#"
            UPDATE harvest_jobs
            SET
                status = $2,
                error_message = $3,
                next_retry_at = $4,
                retry_count = CASE WHEN $5 THEN retry_count + 1 ELSE retry_count END,
                result = COALESCE($6, result),
                updated_at = NOW(),
                completed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE NULL END,
                worker_id = NULL,
                started_at = NULL
            WHERE id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(job_id)
        .bind(new_status)
        .bind(error)
        .bind(next_retry_at)
        .bind(should_increment)
        .bind(result_json(result)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid, result: Option<&JobResult>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE harvest_jobs
            SET
                status = 'cancelled',
                completed_at = NOW(),
                updated_at = NOW(),
                result = COALESCE($2, result),
                worker_id = NULL
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .bind(result_json(result)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<HarvestJob>, AppError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM harvest_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(HarvestJob::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<HarvestJob>, AppError> {
        let rows: Vec<JobRow> = if let Some(s) = status {
            sqlx::query_as(
                r#"
                SELECT * FROM harvest_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(s.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT * FROM harvest_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(HarvestJob::try_from).collect()
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE harvest_jobs
            SET
                status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE harvest_jobs
            SET
                status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM harvest_jobs WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
