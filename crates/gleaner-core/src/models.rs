//! Domain models for the harvest ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SourceType;
use crate::error::AppError;

/// Reconciliation bucket an entry was created in.
///
/// Assigned once at creation and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    New,
    Changed,
    Deleted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::New => "new",
            EntryStatus::Changed => "changed",
            EntryStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(EntryStatus::New),
            "changed" => Ok(EntryStatus::Changed),
            "deleted" => Ok(EntryStatus::Deleted),
            other => Err(AppError::Generic(format!(
                "Unknown harvest entry status: {}",
                other
            ))),
        }
    }
}

/// Where an entry sits in the fetch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Neither content nor error recorded yet.
    Pending,
    Fetched,
    Failed,
    /// Deleted entries are never fetched.
    NotFetchable,
}

/// One ledger row: the unit of work and of harvest history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestEntry {
    pub id: Uuid,
    pub guid: String,
    pub job_id: Uuid,
    pub source_id: String,
    pub local_entity_id: Option<String>,
    pub status: EntryStatus,
    pub current: bool,
    pub content: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub imported_at: Option<DateTime<Utc>>,
    pub import_error: Option<String>,
}

impl HarvestEntry {
    pub fn fetch_state(&self) -> FetchState {
        if self.status == EntryStatus::Deleted {
            return FetchState::NotFetchable;
        }
        match (&self.content, &self.error) {
            (Some(_), _) => FetchState::Fetched,
            (None, Some(_)) => FetchState::Failed,
            (None, None) => FetchState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.fetch_state() == FetchState::Pending
    }

    /// True once the importer has reported back, successfully or not.
    pub fn import_attempted(&self) -> bool {
        self.imported_at.is_some() || self.import_error.is_some()
    }

    /// Whether this entry still has to be handed to the importer.
    pub fn awaiting_import(&self) -> bool {
        if self.import_attempted() {
            return false;
        }
        match self.fetch_state() {
            FetchState::Fetched | FetchState::NotFetchable => true,
            FetchState::Pending | FetchState::Failed => false,
        }
    }
}

/// An entry to be created by the gather stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub guid: String,
    pub status: EntryStatus,
    pub local_entity_id: Option<String>,
    pub current: bool,
}

/// Everything the gather stage writes for one job.
///
/// Applied atomically: previously current entries for `changed` and
/// `deleted` guids are flipped to not current, then the new rows are inserted.
#[derive(Debug, Clone)]
pub struct GatherBatch {
    pub job_id: Uuid,
    pub source_id: String,
    pub entries: Vec<NewEntry>,
}

impl GatherBatch {
    /// Guids whose prior current entry must be superseded.
    pub fn superseded_guids(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.status != EntryStatus::New)
            .map(|e| e.guid.as_str())
    }
}

/// The single fetch-stage write allowed on an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRecord {
    Content(String),
    Error(String),
}

/// What the importer reported for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportRecord {
    Imported { local_entity_id: Option<String> },
    Failed(String),
}

/// A job-level gather error kept in the ledger for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherErrorRecord {
    pub job_id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Job-scoped description of the catalog to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestSource {
    pub url: String,
    pub name: Option<String>,
    pub source_type: SourceType,
    /// Opaque filter expression forwarded to the catalog (CQL for CSW).
    pub filter: Option<String>,
    pub disable_ssl_verification: bool,
}

impl HarvestSource {
    /// A CSW source with no filter.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            source_type: SourceType::Csw,
            filter: None,
            disable_ssl_verification: false,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Ledger key for this source: the endpoint URL.
    pub fn id(&self) -> &str {
        &self.url
    }

    /// Name for log lines, falling back to the URL.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Raw record as returned by a protocol adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub content: String,
    /// Local name of the record's root element, when the body parsed as XML.
    pub document_element: Option<String>,
}

impl RawRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            document_element: None,
        }
    }
}

/// Failure while consuming the identifier stream.
#[derive(Debug)]
pub enum IdentifierError {
    /// One identifier could not be read; the stream continues.
    Record(String),
    /// The listing itself broke; nothing after this point can be trusted.
    Transport(AppError),
}

impl fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierError::Record(msg) => write!(f, "unreadable identifier: {}", msg),
            IdentifierError::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Payload handed to the importer.
#[derive(Debug, Clone, Copy)]
pub struct ImportRequest<'a> {
    pub source_id: &'a str,
    pub guid: &'a str,
    pub status: EntryStatus,
    /// `None` for deleted entries.
    pub content: Option<&'a str>,
    pub local_entity_id: Option<&'a str>,
}

impl<'a> ImportRequest<'a> {
    pub fn from_entry(entry: &'a HarvestEntry) -> Self {
        Self {
            source_id: &entry.source_id,
            guid: &entry.guid,
            status: entry.status,
            content: entry.content.as_deref(),
            local_entity_id: entry.local_entity_id.as_deref(),
        }
    }
}

/// Importer response for a successful import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Id of the local entity created or updated, if the importer assigns one.
    pub local_entity_id: Option<String>,
}
