//! Test utilities and mock implementations for integration tests.
//!
//! Provides in-memory versions of every trait the pipeline and worker
//! depend on, plus a scriptable catalog shared between a factory and the
//! clients it hands out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use gleaner_core::job::{CreateJobRequest, HarvestJob, JobStatus};
use gleaner_core::job_queue::JobQueue;
use gleaner_core::traits::{
    HarvestLedger, IdentifierSource, Importer, RecordFetcher, SourceClientFactory,
};
use gleaner_core::{
    AppError, EntryStatus, FetchRecord, GatherBatch, GatherErrorRecord, HarvestEntry,
    HarvestSource, IdentifierError, ImportOutcome, ImportRecord, ImportRequest, JobResult,
    RawRecord, RetryConfig,
};
use uuid::Uuid;

pub const SOURCE_URL: &str = "https://catalog.example.com/csw";

pub fn source() -> HarvestSource {
    HarvestSource::new(SOURCE_URL).with_name("example")
}

// =============================================================================
// MockCatalog
// =============================================================================

/// One item of a scripted identifier listing.
#[derive(Debug, Clone)]
pub enum Listed {
    Id(String),
    /// A record the adapter could not read; listing continues.
    Unreadable(String),
    /// The listing breaks here.
    Broken(String),
}

pub fn ids(guids: &[&str]) -> Vec<Listed> {
    guids.iter().map(|g| Listed::Id(g.to_string())).collect()
}

/// Scripted answer to one record request.
#[derive(Debug, Clone)]
pub enum Answer {
    Record(String),
    Missing,
    Fail(String),
}

#[derive(Debug, Clone)]
struct Script {
    primary: Answer,
    fallback: Answer,
}

#[derive(Debug, Default)]
pub struct CatalogState {
    pub listing: Vec<Listed>,
    records: HashMap<String, Script>,
    pub primary_calls: HashMap<String, usize>,
    pub fallback_calls: HashMap<String, usize>,
    pub last_filter: Option<String>,
}

/// Scriptable catalog shared by [`MockFactory`] and its clients.
#[derive(Clone, Default)]
pub struct MockCatalog {
    state: Arc<Mutex<CatalogState>>,
    list_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockCatalog {
    pub fn new(listing: Vec<Listed>) -> Self {
        let catalog = Self::default();
        catalog.set_listing(listing);
        catalog
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn set_listing(&self, listing: Vec<Listed>) {
        self.state.lock().unwrap().listing = listing;
    }

    /// Scripts both request encodings for one guid.
    ///
    /// Unscripted guids answer the primary request with `<rec id="guid"/>`.
    pub fn script(&self, guid: &str, primary: Answer, fallback: Answer) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(guid.to_string(), Script { primary, fallback });
    }

    pub fn primary_calls(&self, guid: &str) -> usize {
        *self.state.lock().unwrap().primary_calls.get(guid).unwrap_or(&0)
    }

    pub fn fallback_calls(&self, guid: &str) -> usize {
        *self.state.lock().unwrap().fallback_calls.get(guid).unwrap_or(&0)
    }

    pub fn total_fetch_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.primary_calls.values().sum::<usize>() + state.fallback_calls.values().sum::<usize>()
    }

    pub fn last_filter(&self) -> Option<String> {
        self.state.lock().unwrap().last_filter.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, guid: &str, primary: bool) -> Answer {
        let mut state = self.state.lock().unwrap();
        let calls = if primary {
            &mut state.primary_calls
        } else {
            &mut state.fallback_calls
        };
        *calls.entry(guid.to_string()).or_insert(0) += 1;

        match state.records.get(guid) {
            Some(script) if primary => script.primary.clone(),
            Some(script) => script.fallback.clone(),
            None if primary => Answer::Record(format!("<rec id=\"{}\"/>", guid)),
            None => Answer::Fail("no fallback scripted".to_string()),
        }
    }

    async fn respond(&self, guid: &str, primary: bool) -> Result<Option<RawRecord>, AppError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self.answer(guid, primary);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match answer {
            Answer::Record(content) => Ok(Some(RawRecord::new(content))),
            Answer::Missing => Ok(None),
            Answer::Fail(message) => Err(AppError::NetworkError(message)),
        }
    }
}

impl IdentifierSource for MockCatalog {
    fn list_identifiers<'a>(
        &'a self,
        filter: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, IdentifierError>> {
        let listing = {
            let mut state = self.state.lock().unwrap();
            state.last_filter = filter.map(str::to_string);
            state.listing.clone()
        };
        let delay = self.list_delay;

        stream::iter(listing)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .scan(false, |broken, item| {
                if *broken {
                    return futures::future::ready(None);
                }
                let out = match item {
                    Listed::Id(guid) => Ok(guid),
                    Listed::Unreadable(msg) => Err(IdentifierError::Record(msg)),
                    Listed::Broken(msg) => {
                        *broken = true;
                        Err(IdentifierError::Transport(AppError::NetworkError(msg)))
                    }
                };
                futures::future::ready(Some(out))
            })
            .boxed()
    }
}

impl RecordFetcher for MockCatalog {
    async fn fetch_primary(&self, guid: &str) -> Result<Option<RawRecord>, AppError> {
        self.respond(guid, true).await
    }

    async fn fetch_fallback(&self, guid: &str) -> Result<Option<RawRecord>, AppError> {
        self.respond(guid, false).await
    }
}

// =============================================================================
// MockFactory
// =============================================================================

/// Factory handing out clients over one shared [`MockCatalog`].
#[derive(Clone)]
pub struct MockFactory {
    catalog: MockCatalog,
    fail_connect: Arc<AtomicBool>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    connects: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new(catalog: MockCatalog) -> Self {
        Self {
            catalog,
            fail_connect: Arc::new(AtomicBool::new(false)),
            unreachable: Arc::new(Mutex::new(HashSet::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Connections to `url` fail; other sources are unaffected.
    pub fn set_unreachable(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl SourceClientFactory for MockFactory {
    type Client = MockCatalog;

    async fn connect(&self, source: &HarvestSource) -> Result<MockCatalog, AppError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst)
            || self.unreachable.lock().unwrap().contains(&source.url)
        {
            return Err(AppError::NetworkError("connection refused".to_string()));
        }
        Ok(self.catalog.clone())
    }
}

// =============================================================================
// MockLedger
// =============================================================================

#[derive(Default)]
struct LedgerState {
    entries: Vec<HarvestEntry>,
    gather_errors: Vec<GatherErrorRecord>,
}

/// In-memory ledger enforcing the same write rules as the database.
#[derive(Clone, Default)]
pub struct MockLedger {
    state: Arc<Mutex<LedgerState>>,
    fail_record_fetch: Arc<AtomicBool>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_record_fetch(&self, fail: bool) {
        self.fail_record_fetch.store(fail, Ordering::SeqCst);
    }

    /// Inserts a current entry as if an earlier job had harvested `guid`.
    pub fn seed_current(&self, source_id: &str, guid: &str, local_entity_id: &str) {
        let now = Utc::now();
        self.state.lock().unwrap().entries.push(HarvestEntry {
            id: Uuid::new_v4(),
            guid: guid.to_string(),
            job_id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            local_entity_id: Some(local_entity_id.to_string()),
            status: EntryStatus::New,
            current: true,
            content: Some(format!("<old id=\"{}\"/>", guid)),
            error: None,
            created_at: now,
            fetched_at: Some(now),
            imported_at: Some(now),
            import_error: None,
        });
    }

    pub fn all_entries(&self) -> Vec<HarvestEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    pub fn current_for(&self, source_id: &str, guid: &str) -> Vec<HarvestEntry> {
        self.all_entries()
            .into_iter()
            .filter(|e| e.source_id == source_id && e.guid == guid && e.current)
            .collect()
    }

    pub fn job_entry(&self, job_id: Uuid, guid: &str) -> Option<HarvestEntry> {
        self.all_entries()
            .into_iter()
            .find(|e| e.job_id == job_id && e.guid == guid)
    }

    pub fn gather_error_messages(&self, job_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .gather_errors
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.message.clone())
            .collect()
    }
}

impl HarvestLedger for MockLedger {
    async fn current_entries(
        &self,
        source_id: &str,
    ) -> Result<HashMap<String, Option<String>>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.source_id == source_id && e.current)
            .map(|e| (e.guid.clone(), e.local_entity_id.clone()))
            .collect())
    }

    async fn current_entry(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Option<HarvestEntry>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .find(|e| e.source_id == source_id && e.guid == guid && e.current)
            .cloned())
    }

    async fn commit_gather(&self, batch: GatherBatch) -> Result<Vec<HarvestEntry>, AppError> {
        let mut state = self.state.lock().unwrap();
        let superseded: HashSet<&str> = batch.superseded_guids().collect();

        for entry in state.entries.iter_mut() {
            if entry.source_id == batch.source_id
                && entry.current
                && superseded.contains(entry.guid.as_str())
            {
                entry.current = false;
            }
        }

        let now = Utc::now();
        let created: Vec<HarvestEntry> = batch
            .entries
            .iter()
            .map(|new| HarvestEntry {
                id: Uuid::new_v4(),
                guid: new.guid.clone(),
                job_id: batch.job_id,
                source_id: batch.source_id.clone(),
                local_entity_id: new.local_entity_id.clone(),
                status: new.status,
                current: new.current,
                content: None,
                error: None,
                created_at: now,
                fetched_at: None,
                imported_at: None,
                import_error: None,
            })
            .collect();

        state.entries.extend(created.iter().cloned());
        Ok(created)
    }

    async fn record_fetch(&self, entry_id: Uuid, record: FetchRecord) -> Result<(), AppError> {
        if self.fail_record_fetch.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or(AppError::EntryNotFound(entry_id))?;

        if !entry.is_pending() {
            return Err(AppError::EntryNotPending(entry_id));
        }
        match record {
            FetchRecord::Content(content) => entry.content = Some(content),
            FetchRecord::Error(error) => entry.error = Some(error),
        }
        entry.fetched_at = Some(Utc::now());
        Ok(())
    }

    async fn record_import(&self, entry_id: Uuid, record: ImportRecord) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or(AppError::EntryNotFound(entry_id))?;

        match record {
            ImportRecord::Imported { local_entity_id } => {
                entry.imported_at = Some(Utc::now());
                entry.import_error = None;
                if local_entity_id.is_some() {
                    entry.local_entity_id = local_entity_id;
                }
            }
            ImportRecord::Failed(error) => entry.import_error = Some(error),
        }
        Ok(())
    }

    async fn record_gather_error(&self, job_id: Uuid, message: &str) -> Result<(), AppError> {
        self.state
            .lock()
            .unwrap()
            .gather_errors
            .push(GatherErrorRecord {
                job_id,
                message: message.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn gather_errors(&self, job_id: Uuid) -> Result<Vec<GatherErrorRecord>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .gather_errors
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<HarvestEntry>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// MockImporter
// =============================================================================

/// One call the importer received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportCall {
    pub guid: String,
    pub status: EntryStatus,
    pub content: Option<String>,
    pub local_entity_id: Option<String>,
}

/// Importer that records calls and assigns `local-<guid>` ids.
#[derive(Clone, Default)]
pub struct MockImporter {
    calls: Arc<Mutex<Vec<ImportCall>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MockImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, guid: &str) {
        self.failing.lock().unwrap().insert(guid.to_string());
    }

    pub fn calls(&self) -> Vec<ImportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_for(&self, guid: &str) -> Option<ImportCall> {
        self.calls().into_iter().find(|c| c.guid == guid)
    }
}

impl Importer for MockImporter {
    async fn import(&self, request: ImportRequest<'_>) -> Result<ImportOutcome, AppError> {
        self.calls.lock().unwrap().push(ImportCall {
            guid: request.guid.to_string(),
            status: request.status,
            content: request.content.map(str::to_string),
            local_entity_id: request.local_entity_id.map(str::to_string),
        });

        if self.failing.lock().unwrap().contains(request.guid) {
            return Err(AppError::Generic(format!("cannot import {}", request.guid)));
        }

        let local_entity_id = request
            .local_entity_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("local-{}", request.guid));
        Ok(ImportOutcome {
            local_entity_id: Some(local_entity_id),
        })
    }
}

// =============================================================================
// MockJobQueue
// =============================================================================

/// In-memory job queue.
#[derive(Clone, Default)]
pub struct MockJobQueue {
    jobs: Arc<Mutex<Vec<HarvestJob>>>,
}

impl MockJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: Uuid) -> HarvestJob {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .unwrap()
    }

    fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut HarvestJob) -> T) -> Result<T, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(AppError::JobNotFound(id))?;
        job.updated_at = Utc::now();
        Ok(f(job))
    }
}

impl JobQueue for MockJobQueue {
    async fn create_job(&self, request: CreateJobRequest) -> Result<HarvestJob, AppError> {
        let now = Utc::now();
        let source = request.source;
        let job = HarvestJob {
            id: Uuid::new_v4(),
            source_url: source.url,
            source_name: source.name,
            source_type: source.source_type,
            filter: source.filter,
            disable_ssl_verification: source.disable_ssl_verification,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: request
                .max_retries
                .unwrap_or(RetryConfig::default().max_retries),
            next_retry_at: None,
            error_message: None,
            result: None,
            worker_id: None,
        };
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<HarvestJob>, AppError> {
        let now: DateTime<Utc> = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.iter_mut().find(|j| {
            j.status == JobStatus::Pending && j.next_retry_at.is_none_or(|at| at <= now)
        });
        Ok(job.map(|job| {
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.clone()
        }))
    }

    async fn complete_job(&self, job_id: Uuid, result: &JobResult) -> Result<(), AppError> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Cancelled {
                return;
            }
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.result = Some(result.clone());
            job.worker_id = None;
        })
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        result: Option<&JobResult>,
    ) -> Result<(), AppError> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Cancelled {
                return;
            }
            job.error_message = Some(error.to_string());
            job.result = result.cloned();
            job.worker_id = None;
            match next_retry_at {
                Some(at) => {
                    job.status = JobStatus::Pending;
                    job.retry_count += 1;
                    job.next_retry_at = Some(at);
                }
                None => {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                }
            }
        })
    }

    async fn cancel_job(&self, job_id: Uuid, result: Option<&JobResult>) -> Result<(), AppError> {
        self.update(job_id, |job| {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Cancelled;
            job.result = result.cloned();
            job.completed_at = Some(Utc::now());
            job.worker_id = None;
        })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<HarvestJob>, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<HarvestJob>, AppError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .rev()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.worker_id = None;
            }
        })
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut released = 0;
        for job in jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && j.worker_id.as_deref() == Some(worker_id)
        }) {
            job.status = JobStatus::Pending;
            job.worker_id = None;
            released += 1;
        }
        Ok(released)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == status)
            .count() as i64)
    }
}
