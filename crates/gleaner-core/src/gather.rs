//! Gather stage: list identifiers, reconcile, write pending entries.
//!
//! ```text
//! connect ──► load current guids ──► stream identifiers ──► reconcile ──► commit
//!    │                                     │                     │
//!    └─ connect_error                      └─ stream_error       └─ no_records
//! ```
//!
//! Nothing is written to the ledger until the identifier stream has been
//! consumed completely, so a failed or cancelled gather leaves no entries
//! behind and the job can simply be gathered again.

use std::collections::BTreeSet;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guid::is_invalid_guid;
use crate::models::{EntryStatus, GatherBatch, HarvestEntry, HarvestSource, IdentifierError};
use crate::reconcile::reconcile;
use crate::traits::{HarvestLedger, IdentifierSource, SourceClientFactory};

/// Job-fatal gather failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason")]
pub enum GatherFailure {
    /// The catalog client could not be initialized.
    #[serde(rename = "connect_error")]
    #[error("Error contacting the catalog: {message}")]
    Connect { message: String },

    /// The identifier listing broke before it completed.
    #[serde(rename = "stream_error")]
    #[error("Error gathering the identifiers from the catalog: {message}")]
    Stream { message: String },

    /// Nothing gathered and nothing to delete.
    #[serde(rename = "no_records")]
    #[error("No records received from the catalog")]
    NoRecords,

    /// The ledger rejected a read or the gather commit.
    #[serde(rename = "ledger_error")]
    #[error("Ledger error during gather: {message}")]
    Ledger { message: String },
}

impl GatherFailure {
    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            GatherFailure::Connect { .. } => "connect_error",
            GatherFailure::Stream { .. } => "stream_error",
            GatherFailure::NoRecords => "no_records",
            GatherFailure::Ledger { .. } => "ledger_error",
        }
    }

    /// Whether running the job again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatherFailure::Connect { .. } | GatherFailure::Stream { .. }
        )
    }
}

/// Entries produced by a successful gather pass.
#[derive(Debug, Clone, Default)]
pub struct GatherOutcome {
    /// `new` and `changed` entries, in creation order; these go to the fetch stage.
    pub entries: Vec<HarvestEntry>,
    /// `deleted` entries; never fetched, only handed to the importer.
    pub deleted: Vec<HarvestEntry>,
    pub skipped_invalid: usize,
    pub gather_errors: usize,
}

impl GatherOutcome {
    /// Splits freshly created entries into fetchable and deleted ones.
    pub fn from_entries(created: Vec<HarvestEntry>) -> Self {
        let (deleted, entries) = created
            .into_iter()
            .partition(|e| e.status == EntryStatus::Deleted);
        Self {
            entries,
            deleted,
            ..Self::default()
        }
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        match status {
            EntryStatus::Deleted => self.deleted.len(),
            other => self.entries.iter().filter(|e| e.status == other).count(),
        }
    }
}

/// Builds the job-scoped client for a source.
///
/// A failure is recorded as a gather error for the job and reported as
/// [`GatherFailure::Connect`].
pub async fn connect_source<F, L>(
    factory: &F,
    ledger: &L,
    job_id: Uuid,
    source: &HarvestSource,
) -> Result<F::Client, GatherFailure>
where
    F: SourceClientFactory,
    L: HarvestLedger,
{
    match factory.connect(source).await {
        Ok(client) => Ok(client),
        Err(e) => {
            let failure = GatherFailure::Connect {
                message: e.to_string(),
            };
            tracing::error!(source = source.label(), error = %e, "Could not connect to catalog");
            save_gather_error(ledger, job_id, &failure.to_string()).await;
            Err(failure)
        }
    }
}

/// Records a job-level gather error, logging if the ledger refuses it.
async fn save_gather_error<L: HarvestLedger>(ledger: &L, job_id: Uuid, message: &str) {
    if let Err(e) = ledger.record_gather_error(job_id, message).await {
        tracing::warn!(%job_id, error = %e, "Failed to record gather error");
    }
}

/// Gather stage bound to one job's client and the ledger.
pub struct GatherStage<'a, C, L> {
    client: &'a C,
    ledger: &'a L,
}

impl<'a, C, L> GatherStage<'a, C, L>
where
    C: IdentifierSource,
    L: HarvestLedger,
{
    pub fn new(client: &'a C, ledger: &'a L) -> Self {
        Self { client, ledger }
    }

    /// Runs the gather pass for a job.
    ///
    /// # Returns
    ///
    /// The entries created for this job, or the fatal reason the job stops.
    pub async fn gather(
        &self,
        job_id: Uuid,
        source: &HarvestSource,
    ) -> Result<GatherOutcome, GatherFailure> {
        let source_id = source.id();

        let known = self
            .ledger
            .current_entries(source_id)
            .await
            .map_err(|e| GatherFailure::Ledger {
                message: e.to_string(),
            })?;

        let mut gathered = BTreeSet::new();
        let mut skipped_invalid = 0;
        let mut gather_errors = 0;

        {
            let mut identifiers = self.client.list_identifiers(source.filter.as_deref());
            while let Some(item) = identifiers.next().await {
                match item {
                    Ok(guid) if is_invalid_guid(&guid) => {
                        tracing::warn!(
                            source = source.label(),
                            guid = guid.as_str(),
                            "Skipping invalid identifier"
                        );
                        skipped_invalid += 1;
                    }
                    Ok(guid) => {
                        gathered.insert(guid);
                    }
                    Err(IdentifierError::Record(msg)) => {
                        tracing::warn!(
                            source = source.label(),
                            error = msg.as_str(),
                            "Could not read identifier, continuing"
                        );
                        save_gather_error(self.ledger, job_id, &msg).await;
                        gather_errors += 1;
                    }
                    Err(IdentifierError::Transport(e)) => {
                        let failure = GatherFailure::Stream {
                            message: e.to_string(),
                        };
                        tracing::error!(
                            source = source.label(),
                            gathered = gathered.len(),
                            error = %e,
                            "Identifier listing failed"
                        );
                        save_gather_error(self.ledger, job_id, &failure.to_string()).await;
                        return Err(failure);
                    }
                }
            }
        }

        let known_guids: BTreeSet<String> = known.keys().cloned().collect();
        let reconciliation = reconcile(&known_guids, &gathered);

        if reconciliation.is_empty() {
            let failure = GatherFailure::NoRecords;
            tracing::warn!(source = source.label(), "No records received from the catalog");
            save_gather_error(self.ledger, job_id, &failure.to_string()).await;
            return Err(failure);
        }

        tracing::info!(
            source = source.label(),
            new = reconciliation.new.len(),
            changed = reconciliation.changed.len(),
            deleted = reconciliation.deleted.len(),
            "Reconciled identifiers"
        );

        let batch = GatherBatch {
            job_id,
            source_id: source_id.to_string(),
            entries: reconciliation.into_entries(&known),
        };

        let created = self
            .ledger
            .commit_gather(batch)
            .await
            .map_err(|e| GatherFailure::Ledger {
                message: e.to_string(),
            })?;

        let mut outcome = GatherOutcome::from_entries(created);
        outcome.skipped_invalid = skipped_invalid;
        outcome.gather_errors = gather_errors;
        Ok(outcome)
    }
}
