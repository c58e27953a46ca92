//! Progress reporting for harvest runs.
//!
//! The pipeline emits [`HarvestEvent`]s through a [`ProgressReporter`] so
//! frontends decide how to render them; the library itself only logs.

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gather::GatherFailure;
use crate::sync::{BatchHarvestSummary, JobResult};

/// Events emitted while harvesting.
#[derive(Debug, Clone)]
pub enum HarvestEvent<'a> {
    /// Batch harvest started.
    BatchStarted { total_sources: usize },
    /// One source of a batch started.
    SourceStarted {
        source_index: usize,
        total_sources: usize,
        source_name: &'a str,
        source_url: &'a str,
    },
    /// A job found its entries already in the ledger and skips gathering.
    JobResumed { job_id: Uuid, pending: usize },
    /// Gather pass committed its entries.
    GatherCompleted {
        job_id: Uuid,
        new: usize,
        changed: usize,
        deleted: usize,
        skipped_invalid: usize,
    },
    /// Gather pass stopped the job.
    GatherFailed {
        job_id: Uuid,
        failure: &'a GatherFailure,
    },
    /// Periodic fetch progress.
    EntriesFetched {
        current: usize,
        total: usize,
        fetched_ok: usize,
        fetched_failed: usize,
    },
    /// Job stopped early on cancellation; remaining entries stay pending.
    JobCancelled { job_id: Uuid, result: &'a JobResult },
    /// Job finished.
    JobCompleted { job_id: Uuid, result: &'a JobResult },
    /// Batch stopped early on cancellation.
    BatchCancelled {
        completed_sources: usize,
        total_sources: usize,
    },
    /// Batch finished.
    BatchCompleted { summary: &'a BatchHarvestSummary },
}

/// Receiver of harvest progress events.
pub trait ProgressReporter: Send + Sync {
    /// Called when a harvest event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: HarvestEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Reporter that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::BatchStarted { total_sources } => {
                info!("Starting batch harvest of {} sources", total_sources);
            }
            HarvestEvent::SourceStarted {
                source_index,
                total_sources,
                source_name,
                source_url,
            } => {
                info!(
                    "[{}/{}] Harvesting {} ({})",
                    source_index + 1,
                    total_sources,
                    source_name,
                    source_url
                );
            }
            HarvestEvent::JobResumed { job_id, pending } => {
                info!(%job_id, pending, "Resuming job from ledger, gather skipped");
            }
            HarvestEvent::GatherCompleted {
                job_id,
                new,
                changed,
                deleted,
                skipped_invalid,
            } => {
                info!(
                    %job_id,
                    new,
                    changed,
                    deleted,
                    skipped_invalid,
                    "Gather completed"
                );
            }
            HarvestEvent::GatherFailed { job_id, failure } => {
                error!(%job_id, reason = failure.reason(), "{}", failure);
            }
            HarvestEvent::EntriesFetched {
                current,
                total,
                fetched_ok,
                fetched_failed,
            } => {
                let pct = if total > 0 { current * 100 / total } else { 100 };
                info!(
                    "Fetch progress: {}/{} ({}%) - {} ok, {} failed",
                    current, total, pct, fetched_ok, fetched_failed
                );
            }
            HarvestEvent::JobCancelled { job_id, result } => {
                warn!(
                    %job_id,
                    fetched_ok = result.fetched_ok,
                    fetched_failed = result.fetched_failed,
                    "Job cancelled, unfetched entries remain pending"
                );
            }
            HarvestEvent::JobCompleted { job_id, result } => {
                info!(
                    %job_id,
                    gathered = result.gathered,
                    deleted = result.deleted,
                    fetched_ok = result.fetched_ok,
                    fetched_failed = result.fetched_failed,
                    imported = result.imported,
                    import_failed = result.import_failed,
                    "Job completed"
                );
            }
            HarvestEvent::BatchCancelled {
                completed_sources,
                total_sources,
            } => {
                warn!(
                    "Batch harvest cancelled after {}/{} sources",
                    completed_sources, total_sources
                );
            }
            HarvestEvent::BatchCompleted { summary } => {
                info!(
                    "Batch complete: {} of {} sources succeeded, {} records fetched, {} failed",
                    summary.successful_count(),
                    summary.total_sources(),
                    summary.total_fetched_ok(),
                    summary.total_fetched_failed()
                );
            }
        }
    }
}
