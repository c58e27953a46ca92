//! Job and batch outcome bookkeeping.
//!
//! Pure counters, decoupled from I/O; the pipeline fills them and the
//! job queue stores them alongside the job.

use serde::{Deserialize, Serialize};

use crate::gather::GatherFailure;

/// Result of one step (fetch or import) for a single entry in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
    /// Not attempted in this run (already done, cancelled, or not applicable).
    Skipped,
}

/// What happened to a single entry during one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryReport {
    pub fetch: StepOutcome,
    pub import: StepOutcome,
}

impl EntryReport {
    pub fn skipped() -> Self {
        Self {
            fetch: StepOutcome::Skipped,
            import: StepOutcome::Skipped,
        }
    }
}

/// Aggregate outcome of one harvest job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Valid identifiers seen by the gather pass (`new + changed`).
    pub gathered: usize,
    pub new: usize,
    pub changed: usize,
    pub deleted: usize,
    /// Identifiers dropped because they looked like paging errors.
    pub skipped_invalid: usize,
    /// Unreadable identifiers recorded as gather errors.
    pub gather_errors: usize,
    pub fetched_ok: usize,
    pub fetched_failed: usize,
    pub imported: usize,
    pub import_failed: usize,
    /// Gather was skipped because the ledger already held this job's entries.
    pub resumed: bool,
    pub cancelled: bool,
    pub fatal: Option<GatherFailure>,
}

impl JobResult {
    /// A result for a job that stopped on a fatal gather failure.
    pub fn fatal(failure: GatherFailure) -> Self {
        Self {
            fatal: Some(failure),
            ..Self::default()
        }
    }

    /// Adds one entry's outcome to the tallies.
    pub fn record(&mut self, report: EntryReport) {
        match report.fetch {
            StepOutcome::Succeeded => self.fetched_ok += 1,
            StepOutcome::Failed => self.fetched_failed += 1,
            StepOutcome::Skipped => {}
        }
        match report.import {
            StepOutcome::Succeeded => self.imported += 1,
            StepOutcome::Failed => self.import_failed += 1,
            StepOutcome::Skipped => {}
        }
    }

    /// True when the job ran to the end without a fatal failure.
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && !self.cancelled
    }

    /// Number of entries that reached a terminal fetch state in this run.
    pub fn fetched_total(&self) -> usize {
        self.fetched_ok + self.fetched_failed
    }
}

/// Result of harvesting one source within a batch.
#[derive(Debug, Clone)]
pub struct SourceHarvestResult {
    pub source_name: String,
    pub source_url: String,
    pub result: JobResult,
}

/// Summary of a batch harvest across several sources.
#[derive(Debug, Clone, Default)]
pub struct BatchHarvestSummary {
    pub results: Vec<SourceHarvestResult>,
}

impl BatchHarvestSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: SourceHarvestResult) {
        self.results.push(result);
    }

    /// Sources whose job ended with a fatal gather failure.
    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.result.fatal.is_some())
            .count()
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_success()).count()
    }

    pub fn total_sources(&self) -> usize {
        self.results.len()
    }

    pub fn total_fetched_ok(&self) -> usize {
        self.results.iter().map(|r| r.result.fetched_ok).sum()
    }

    pub fn total_fetched_failed(&self) -> usize {
        self.results.iter().map(|r| r.result.fetched_failed).sum()
    }
}
