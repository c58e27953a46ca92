//! Trait definitions for external dependencies.
//!
//! The pipeline only talks to catalogs, storage and the importer through
//! these traits, so each protocol gets one client implementation and tests
//! can run the whole pipeline against in-memory mocks.

use std::collections::HashMap;
use std::future::Future;

use futures::stream::BoxStream;
use uuid::Uuid;

use crate::AppError;
use crate::models::{
    FetchRecord, GatherBatch, GatherErrorRecord, HarvestEntry, HarvestSource, IdentifierError,
    ImportOutcome, ImportRecord, ImportRequest, RawRecord,
};

/// Paged listing of the identifiers a catalog holds.
pub trait IdentifierSource: Send + Sync {
    /// Lists identifiers, optionally narrowed by a catalog-side filter.
    ///
    /// Each call starts paging from the beginning. The stream is lazy: pages
    /// are requested as the consumer pulls.
    ///
    /// # Arguments
    ///
    /// * `filter` - Opaque filter expression forwarded to the catalog
    ///
    /// # Returns
    ///
    /// Identifiers in catalog order. `IdentifierError::Record` items may be
    /// skipped; an `IdentifierError::Transport` item ends the listing.
    fn list_identifiers<'a>(
        &'a self,
        filter: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, IdentifierError>>;
}

/// Retrieval of one record by identifier, with two request encodings.
pub trait RecordFetcher: Send + Sync {
    /// Retrieves a record using the preferred request encoding.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the catalog answered but holds no such record.
    fn fetch_primary(
        &self,
        guid: &str,
    ) -> impl Future<Output = Result<Option<RawRecord>, AppError>> + Send;

    /// Retrieves a record using the alternate request encoding.
    ///
    /// Must return the same logical record shape as [`fetch_primary`](Self::fetch_primary).
    fn fetch_fallback(
        &self,
        guid: &str,
    ) -> impl Future<Output = Result<Option<RawRecord>, AppError>> + Send;
}

/// Factory for job-scoped catalog clients.
///
/// Separate from the client traits so connection setup can be async and
/// fail without a half-built client.
pub trait SourceClientFactory: Send + Sync + Clone {
    /// The client type this factory creates.
    type Client: IdentifierSource + RecordFetcher;

    /// Creates and initializes a client for one source.
    ///
    /// # Arguments
    ///
    /// * `source` - Endpoint, filter and TLS settings for the job
    fn connect(
        &self,
        source: &HarvestSource,
    ) -> impl Future<Output = Result<Self::Client, AppError>> + Send;
}

/// Durable store of harvest entries.
///
/// Only the gather stage creates entries and only the fetch stage sets
/// `content`/`error`; implementations enforce the second rule by refusing
/// to write fetch results onto a non-pending entry.
pub trait HarvestLedger: Send + Sync + Clone {
    /// Returns every guid with a current entry for the source.
    ///
    /// # Returns
    ///
    /// A map from guid to the local entity id of its current entry.
    fn current_entries(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<HashMap<String, Option<String>>, AppError>> + Send;

    /// Point lookup of the current entry for one guid.
    fn current_entry(
        &self,
        source_id: &str,
        guid: &str,
    ) -> impl Future<Output = Result<Option<HarvestEntry>, AppError>> + Send;

    /// Applies a gather pass atomically.
    ///
    /// Prior current entries of `changed`/`deleted` guids are marked not
    /// current before the new rows become visible.
    ///
    /// # Returns
    ///
    /// The created entries.
    fn commit_gather(
        &self,
        batch: GatherBatch,
    ) -> impl Future<Output = Result<Vec<HarvestEntry>, AppError>> + Send;

    /// Records the fetch result of a pending entry.
    ///
    /// # Errors
    ///
    /// `AppError::EntryNotPending` if the entry already has content or error,
    /// or is a deleted entry.
    fn record_fetch(
        &self,
        entry_id: Uuid,
        record: FetchRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Records what the importer reported for an entry.
    fn record_import(
        &self,
        entry_id: Uuid,
        record: ImportRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Stores a job-level gather error message.
    fn record_gather_error(
        &self,
        job_id: Uuid,
        message: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Lists gather errors recorded for a job, oldest first.
    fn gather_errors(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Vec<GatherErrorRecord>, AppError>> + Send;

    /// Lists every entry created by a job, in creation order.
    fn entries_for_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Vec<HarvestEntry>, AppError>> + Send;
}

/// Downstream consumer of fetched records.
///
/// Receives every fetched entry and every deleted entry (with no content).
pub trait Importer: Send + Sync + Clone {
    /// Materializes, updates or removes the local record for one entry.
    fn import(
        &self,
        request: ImportRequest<'_>,
    ) -> impl Future<Output = Result<ImportOutcome, AppError>> + Send;
}
