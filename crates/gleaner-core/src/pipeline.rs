//! Pipeline driver: gather → fetch → import for one job.
//!
//! # Architecture
//!
//! [`HarvestPipeline`] is generic over three traits:
//! - [`SourceClientFactory`] - builds the job-scoped catalog client
//! - [`HarvestLedger`] - durable entry store
//! - [`Importer`] - downstream consumer of fetched records
//!
//! The driver never returns an error: job-fatal problems end up in
//! [`JobResult::fatal`], entry-level problems in the ledger and the tallies.
//!
//! # Resumption
//!
//! A job whose entries are already in the ledger is never gathered again.
//! Pending entries are fetched, and fetched or deleted entries that have no
//! import outcome yet are handed to the importer. Re-running a finished job
//! is therefore a no-op.
//!
//! # Cancellation Support
//!
//! The `*_cancellable` methods accept a `CancellationToken`:
//! - during gather: the pass is abandoned before anything is written
//! - between gather and fetch, or mid-fetch: entries not yet started stay
//!   pending; in-flight fetches complete and are recorded

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::fetch::{FetchOutcome, FetchStage};
use crate::gather::{GatherFailure, GatherStage, connect_source};
use crate::models::{EntryStatus, HarvestEntry, HarvestSource, ImportRecord, ImportRequest};
use crate::progress::{HarvestEvent, ProgressReporter, SilentReporter};
use crate::sync::{EntryReport, JobResult, StepOutcome};
use crate::traits::{HarvestLedger, Importer, SourceClientFactory};

/// Harvest driver for one catalog protocol, ledger and importer.
///
/// # Example
///
/// ```ignore
/// use gleaner_core::{HarvestPipeline, HarvestSource};
///
/// let pipeline = HarvestPipeline::new(csw_factory, ledger, importer);
/// let result = pipeline
///     .run_job(Uuid::new_v4(), &HarvestSource::new("https://example.org/csw"))
///     .await;
/// println!("{} fetched, {} failed", result.fetched_ok, result.fetched_failed);
/// ```
pub struct HarvestPipeline<F, L, I>
where
    F: SourceClientFactory,
    L: HarvestLedger,
    I: Importer,
{
    factory: F,
    ledger: L,
    importer: I,
    config: HarvestConfig,
}

impl<F, L, I> Clone for HarvestPipeline<F, L, I>
where
    F: SourceClientFactory,
    L: HarvestLedger,
    I: Importer,
{
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            ledger: self.ledger.clone(),
            importer: self.importer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<F, L, I> HarvestPipeline<F, L, I>
where
    F: SourceClientFactory,
    L: HarvestLedger,
    I: Importer,
{
    /// Creates a pipeline with default configuration (sequential fetch).
    pub fn new(factory: F, ledger: L, importer: I) -> Self {
        Self::with_config(factory, ledger, importer, HarvestConfig::default())
    }

    /// Creates a pipeline with custom configuration.
    pub fn with_config(factory: F, ledger: L, importer: I, config: HarvestConfig) -> Self {
        Self {
            factory,
            ledger,
            importer,
            config,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Runs one job to completion.
    pub async fn run_job(&self, job_id: Uuid, source: &HarvestSource) -> JobResult {
        self.run_job_cancellable(job_id, source, &SilentReporter, CancellationToken::new())
            .await
    }

    /// Runs one job with progress reporting and cancellation support.
    pub async fn run_job_cancellable<R: ProgressReporter>(
        &self,
        job_id: Uuid,
        source: &HarvestSource,
        reporter: &R,
        cancel_token: CancellationToken,
    ) -> JobResult {
        let existing = match self.ledger.entries_for_job(job_id).await {
            Ok(entries) => entries,
            Err(e) => {
                let failure = GatherFailure::Ledger {
                    message: e.to_string(),
                };
                reporter.report(HarvestEvent::GatherFailed {
                    job_id,
                    failure: &failure,
                });
                return JobResult::fatal(failure);
            }
        };

        let mut result = JobResult::default();

        let (client, entries, deleted) = if existing.is_empty() {
            let client =
                match connect_source(&self.factory, &self.ledger, job_id, source).await {
                    Ok(client) => client,
                    Err(failure) => {
                        reporter.report(HarvestEvent::GatherFailed {
                            job_id,
                            failure: &failure,
                        });
                        return JobResult::fatal(failure);
                    }
                };

            let gather = GatherStage::new(&client, &self.ledger);
            let outcome = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    result.cancelled = true;
                    reporter.report(HarvestEvent::JobCancelled { job_id, result: &result });
                    return result;
                }
                outcome = gather.gather(job_id, source) => outcome,
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(failure) => {
                    reporter.report(HarvestEvent::GatherFailed {
                        job_id,
                        failure: &failure,
                    });
                    return JobResult::fatal(failure);
                }
            };

            result.skipped_invalid = outcome.skipped_invalid;
            result.gather_errors = outcome.gather_errors;
            reporter.report(HarvestEvent::GatherCompleted {
                job_id,
                new: outcome.count(EntryStatus::New),
                changed: outcome.count(EntryStatus::Changed),
                deleted: outcome.deleted.len(),
                skipped_invalid: outcome.skipped_invalid,
            });
            (Some(client), outcome.entries, outcome.deleted)
        } else {
            result.resumed = true;
            let (deleted, entries): (Vec<_>, Vec<_>) = existing
                .into_iter()
                .partition(|e| e.status == EntryStatus::Deleted);
            let pending = entries.iter().filter(|e| e.is_pending()).count();
            reporter.report(HarvestEvent::JobResumed { job_id, pending });

            let client = if pending > 0 {
                match connect_source(&self.factory, &self.ledger, job_id, source).await {
                    Ok(client) => Some(client),
                    Err(failure) => {
                        reporter.report(HarvestEvent::GatherFailed {
                            job_id,
                            failure: &failure,
                        });
                        return JobResult {
                            resumed: true,
                            ..JobResult::fatal(failure)
                        };
                    }
                }
            } else {
                None
            };
            (client, entries, deleted)
        };

        result.new = count_status(&entries, EntryStatus::New);
        result.changed = count_status(&entries, EntryStatus::Changed);
        result.deleted = deleted.len();
        result.gathered = result.new + result.changed;

        if cancel_token.is_cancelled() {
            result.cancelled = true;
            reporter.report(HarvestEvent::JobCancelled {
                job_id,
                result: &result,
            });
            return result;
        }

        // =====================================================================
        // Fetch + import
        //
        // Entries run through a bounded pool (size 1 keeps gather order).
        // The loop below only ends once every started entry has finished,
        // so tallies are complete before the job result is returned.
        // =====================================================================

        let fetch_stage = client.as_ref().map(|c| FetchStage::new(c, &self.ledger));
        let fetch_stage = fetch_stage.as_ref();
        let total = entries.len();
        let report_interval = std::cmp::max(total / 20, 10);
        let mut processed = 0;
        let mut skipped_on_cancel = false;

        let this = self;
        let token = cancel_token.clone();
        let mut reports = stream::iter(entries)
            .map(move |entry| {
                let token = token.clone();
                async move {
                    if token.is_cancelled() {
                        return None;
                    }
                    Some(this.process_entry(fetch_stage, entry).await)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(report) = reports.next().await {
            processed += 1;
            match report {
                Some(report) => result.record(report),
                None => skipped_on_cancel = true,
            }
            if processed % report_interval == 0 || processed == total {
                reporter.report(HarvestEvent::EntriesFetched {
                    current: processed,
                    total,
                    fetched_ok: result.fetched_ok,
                    fetched_failed: result.fetched_failed,
                });
            }
        }
        drop(reports);

        for entry in deleted.iter().filter(|e| e.awaiting_import()) {
            if cancel_token.is_cancelled() {
                skipped_on_cancel = true;
                break;
            }
            let import = self.import_entry(entry).await;
            result.record(EntryReport {
                fetch: StepOutcome::Skipped,
                import,
            });
        }

        if skipped_on_cancel {
            result.cancelled = true;
            reporter.report(HarvestEvent::JobCancelled {
                job_id,
                result: &result,
            });
        } else {
            reporter.report(HarvestEvent::JobCompleted {
                job_id,
                result: &result,
            });
        }

        result
    }

    /// Fetches (if pending) and imports (if fetched) one entry.
    async fn process_entry(
        &self,
        fetch_stage: Option<&FetchStage<'_, F::Client, L>>,
        mut entry: HarvestEntry,
    ) -> EntryReport {
        let mut report = EntryReport::skipped();

        if entry.is_pending() {
            let Some(stage) = fetch_stage else {
                return report;
            };
            match stage.fetch(&entry).await {
                FetchOutcome::FetchedOk { content } => {
                    report.fetch = StepOutcome::Succeeded;
                    entry.content = Some(content);
                }
                FetchOutcome::FetchFailed(_) => {
                    report.fetch = StepOutcome::Failed;
                    return report;
                }
            }
        }

        if entry.awaiting_import() {
            report.import = self.import_entry(&entry).await;
        }

        report
    }

    /// Hands one entry to the importer and records its answer.
    async fn import_entry(&self, entry: &HarvestEntry) -> StepOutcome {
        let (record, outcome) = match self.importer.import(ImportRequest::from_entry(entry)).await
        {
            Ok(imported) => (
                ImportRecord::Imported {
                    local_entity_id: imported.local_entity_id,
                },
                StepOutcome::Succeeded,
            ),
            Err(e) => {
                tracing::warn!(
                    guid = entry.guid.as_str(),
                    status = entry.status.as_str(),
                    error = %e,
                    "Import failed"
                );
                (ImportRecord::Failed(e.to_string()), StepOutcome::Failed)
            }
        };

        if let Err(e) = self.ledger.record_import(entry.id, record).await {
            tracing::warn!(
                guid = entry.guid.as_str(),
                error = %e,
                "Failed to record import outcome"
            );
        }

        outcome
    }
}

fn count_status(entries: &[HarvestEntry], status: EntryStatus) -> usize {
    entries.iter().filter(|e| e.status == status).count()
}
