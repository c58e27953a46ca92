//! Job queue trait for abstracting job persistence.
//!
//! Implemented by the PostgreSQL repository in `gleaner-db` and by an
//! in-memory queue in the integration tests.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, HarvestJob, JobStatus};
use crate::sync::JobResult;

/// Persistence operations the worker needs from a job queue.
///
/// Implementations must claim atomically (`SELECT ... FOR UPDATE SKIP
/// LOCKED` or equivalent) so two workers never run the same job.
pub trait JobQueue: Send + Sync + Clone {
    /// Enqueues a job in `pending` state.
    fn create_job(
        &self,
        request: CreateJobRequest,
    ) -> impl Future<Output = Result<HarvestJob, AppError>> + Send;

    /// Claims the oldest runnable pending job for `worker_id`.
    ///
    /// A job scheduled for retry is runnable once `next_retry_at` has passed.
    /// Returns `None` if nothing is runnable.
    fn claim_job(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<HarvestJob>, AppError>> + Send;

    fn complete_job(
        &self,
        job_id: Uuid,
        result: &JobResult,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Records a failed run.
    ///
    /// With `next_retry_at` the job goes back to `pending` and its retry
    /// count is incremented; without it the job is permanently `failed`.
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        result: Option<&JobResult>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Marks a `pending` or `running` job as `cancelled`; finished jobs are left alone.
    ///
    /// A cancelled job is never completed or failed afterwards, even if a
    /// worker was still running it.
    fn cancel_job(
        &self,
        job_id: Uuid,
        result: Option<&JobResult>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<HarvestJob>, AppError>> + Send;

    /// Newest first.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HarvestJob>, AppError>> + Send;

    /// Puts a `running` job back to `pending` without touching its retry count.
    fn release_job(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Releases every job held by a worker; returns how many were released.
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}
