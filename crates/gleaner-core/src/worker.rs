//! Worker service for processing harvest jobs from the queue.
//!
//! ```text
//! loop {
//!     1. Check for cancellation
//!     2. Claim next runnable job (SELECT FOR UPDATE SKIP LOCKED)
//!     3. Run it through HarvestPipeline under the job's own id
//!     4. completed / failed (maybe scheduled for retry) / released
//!     5. If the queue is empty, sleep for poll_interval
//! }
//! ```
//!
//! # Graceful Shutdown
//!
//! On cancellation the worker stops claiming, lets the running job wind
//! down (in-flight fetches finish, the rest stay pending in the ledger) and
//! puts it back to `pending`. The next worker that claims it resumes from
//! the ledger instead of gathering again.
//!
//! # Example
//!
//! ```ignore
//! use gleaner_core::worker::{TracingWorkerReporter, WorkerService};
//! use gleaner_core::{TracingReporter, WorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let worker = WorkerService::new(job_queue, pipeline, WorkerConfig::default());
//! worker.run(CancellationToken::new(), &TracingWorkerReporter, &TracingReporter).await?;
//! ```

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, HarvestJob, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::models::HarvestSource;
use crate::pipeline::HarvestPipeline;
use crate::progress::{HarvestEvent, ProgressReporter};
use crate::sync::{BatchHarvestSummary, JobResult, SourceHarvestResult};
use crate::traits::{HarvestLedger, Importer, SourceClientFactory};

// =============================================================================
// Worker Events
// =============================================================================

/// Events emitted by the worker during operation.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started { worker_id: &'a str },
    Polling,
    JobClaimed { job: &'a HarvestJob },
    JobStarted { job_id: Uuid, source_url: &'a str },
    JobCompleted { job_id: Uuid, result: &'a JobResult },
    /// Job stopped on a fatal reason.
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    /// Job interrupted by shutdown and returned to the queue.
    JobReleased { job_id: Uuid, result: &'a JobResult },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped { worker_id: &'a str },
}

// =============================================================================
// Worker Reporter Trait
// =============================================================================

/// Receiver of worker-level events.
///
/// Job-internal progress goes through [`ProgressReporter`] instead.
pub trait WorkerReporter: Send + Sync {
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentWorkerReporter;

impl WorkerReporter for SilentWorkerReporter {}

/// Worker reporter that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                info!(worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs...");
            }
            WorkerEvent::JobClaimed { job } => {
                info!(
                    job_id = %job.id,
                    source = %job.source_url,
                    attempt = job.retry_count + 1,
                    "Job claimed"
                );
            }
            WorkerEvent::JobStarted { job_id, source_url } => {
                info!(%job_id, source = source_url, "Processing job");
            }
            WorkerEvent::JobCompleted { job_id, result } => {
                info!(
                    %job_id,
                    new = result.new,
                    changed = result.changed,
                    deleted = result.deleted,
                    fetched_ok = result.fetched_ok,
                    fetched_failed = result.fetched_failed,
                    "Job completed"
                );
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                if will_retry {
                    warn!(%job_id, %error, "Job failed, will retry");
                } else {
                    error!(%job_id, %error, "Job permanently failed");
                }
            }
            WorkerEvent::JobReleased { job_id, result } => {
                info!(
                    %job_id,
                    fetched = result.fetched_total(),
                    "Job interrupted, released back to the queue"
                );
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                info!(worker_id, jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                info!(worker_id, "Worker stopped");
            }
        }
    }
}

// =============================================================================
// Worker Service
// =============================================================================

/// Polls the queue and runs claimed jobs through a [`HarvestPipeline`].
pub struct WorkerService<Q, F, L, I>
where
    Q: JobQueue,
    F: SourceClientFactory,
    L: HarvestLedger,
    I: Importer,
{
    queue: Q,
    pipeline: HarvestPipeline<F, L, I>,
    config: WorkerConfig,
}

impl<Q, F, L, I> WorkerService<Q, F, L, I>
where
    Q: JobQueue,
    F: SourceClientFactory,
    L: HarvestLedger,
    I: Importer,
{
    pub fn new(queue: Q, pipeline: HarvestPipeline<F, L, I>, config: WorkerConfig) -> Self {
        Self {
            queue,
            pipeline,
            config,
        }
    }

    /// Runs the worker until cancelled.
    pub async fn run<WR, HR>(
        &self,
        cancel_token: CancellationToken,
        worker_reporter: &WR,
        harvest_reporter: &HR,
    ) -> Result<(), AppError>
    where
        WR: WorkerReporter,
        HR: ProgressReporter,
    {
        worker_reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            worker_reporter.report(WorkerEvent::Polling);

            match self.queue.claim_job(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    worker_reporter.report(WorkerEvent::JobClaimed { job: &job });
                    self.process_job(&job, &cancel_token, worker_reporter, harvest_reporter)
                        .await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        let released = match self.queue.release_worker_jobs(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to release worker jobs");
                0
            }
        };

        worker_reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        worker_reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    async fn process_job<WR, HR>(
        &self,
        job: &HarvestJob,
        cancel_token: &CancellationToken,
        worker_reporter: &WR,
        harvest_reporter: &HR,
    ) -> JobResult
    where
        WR: WorkerReporter,
        HR: ProgressReporter,
    {
        worker_reporter.report(WorkerEvent::JobStarted {
            job_id: job.id,
            source_url: &job.source_url,
        });

        let source = job.source();
        let result = self
            .pipeline
            .run_job_cancellable(job.id, &source, harvest_reporter, cancel_token.child_token())
            .await;

        if let Some(failure) = &result.fatal {
            let message = failure.to_string();
            let will_retry = job.can_retry() && failure.is_retryable();

            worker_reporter.report(WorkerEvent::JobFailed {
                job_id: job.id,
                error: &message,
                will_retry,
            });

            let next_retry = will_retry.then(|| job.calculate_next_retry(&self.config.retry_config));
            if let Err(e) = self
                .queue
                .fail_job(job.id, &message, next_retry, Some(&result))
                .await
            {
                error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
            }
        } else if result.cancelled {
            worker_reporter.report(WorkerEvent::JobReleased {
                job_id: job.id,
                result: &result,
            });

            if let Err(e) = self.queue.release_job(job.id).await {
                error!(job_id = %job.id, error = %e, "Failed to release job");
            }
        } else {
            worker_reporter.report(WorkerEvent::JobCompleted {
                job_id: job.id,
                result: &result,
            });

            if let Err(e) = self.queue.complete_job(job.id, &result).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job as completed");
            }
        }

        result
    }

    /// Runs one job by id outside the polling loop.
    ///
    /// The job must be claimable; its status is updated exactly as in [`run`](Self::run).
    pub async fn process_single_job<WR, HR>(
        &self,
        job_id: Uuid,
        cancel_token: CancellationToken,
        worker_reporter: &WR,
        harvest_reporter: &HR,
    ) -> Result<JobResult, AppError>
    where
        WR: WorkerReporter,
        HR: ProgressReporter,
    {
        let job = self
            .queue
            .get_job(job_id)
            .await?
            .ok_or(AppError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            return Err(AppError::Generic(format!(
                "Job {} is already {}",
                job_id, job.status
            )));
        }

        Ok(self
            .process_job(&job, &cancel_token, worker_reporter, harvest_reporter)
            .await)
    }

    /// Queues one job per source and runs them here, one after another.
    ///
    /// A fatal failure of one source does not stop the others. On
    /// cancellation the interrupted job goes back to `pending` and the
    /// remaining sources are not queued.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails.
    pub async fn harvest_sources<WR, HR>(
        &self,
        sources: &[HarvestSource],
        cancel_token: CancellationToken,
        worker_reporter: &WR,
        harvest_reporter: &HR,
    ) -> Result<BatchHarvestSummary, AppError>
    where
        WR: WorkerReporter,
        HR: ProgressReporter,
    {
        let mut summary = BatchHarvestSummary::new();
        let total = sources.len();

        harvest_reporter.report(HarvestEvent::BatchStarted {
            total_sources: total,
        });

        for (i, source) in sources.iter().enumerate() {
            if cancel_token.is_cancelled() {
                harvest_reporter.report(HarvestEvent::BatchCancelled {
                    completed_sources: i,
                    total_sources: total,
                });
                return Ok(summary);
            }

            harvest_reporter.report(HarvestEvent::SourceStarted {
                source_index: i,
                total_sources: total,
                source_name: source.label(),
                source_url: &source.url,
            });

            let job = self
                .queue
                .create_job(CreateJobRequest::new(source.clone()))
                .await?;
            let result = self
                .process_single_job(
                    job.id,
                    cancel_token.clone(),
                    worker_reporter,
                    harvest_reporter,
                )
                .await?;
            let cancelled = result.cancelled;

            summary.add(SourceHarvestResult {
                source_name: source.label().to_string(),
                source_url: source.url.clone(),
                result,
            });

            if cancelled {
                warn!(job_id = %job.id, "Job interrupted; a worker resumes it from the ledger");
                harvest_reporter.report(HarvestEvent::BatchCancelled {
                    completed_sources: i + 1,
                    total_sources: total,
                });
                return Ok(summary);
            }
        }

        harvest_reporter.report(HarvestEvent::BatchCompleted { summary: &summary });
        Ok(summary)
    }
}
