//! Fetch stage: retrieve raw content for pending entries.
//!
//! Each entry gets one primary request and, only if that raises, one
//! fallback request. The outcome is written to the ledger once and
//! returned as a typed value; no error escapes this module.

use serde::{Deserialize, Serialize};

use crate::AppError;
use crate::guid::is_invalid_guid;
use crate::models::{EntryStatus, FetchRecord, HarvestEntry, RawRecord};
use crate::traits::{HarvestLedger, RecordFetcher};

/// Why an entry could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FetchFailure {
    #[error("Invalid identifier: {guid}")]
    InvalidIdentifier { guid: String },

    #[error(
        "Error getting the record with GUID {guid}: primary request failed ({primary}), fallback request failed ({fallback})"
    )]
    Retrieval {
        guid: String,
        primary: String,
        fallback: String,
    },

    #[error("Empty record for GUID {guid}")]
    EmptyRecord { guid: String },

    #[error("Deleted entry for GUID {guid} is never fetched")]
    NotFetchable { guid: String },

    #[error("Could not store record for GUID {guid}: {message}")]
    Persist { guid: String, message: String },
}

impl FetchFailure {
    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchFailure::InvalidIdentifier { .. } => "invalid_identifier",
            FetchFailure::Retrieval { .. } => "retrieval_error",
            FetchFailure::EmptyRecord { .. } => "empty_record",
            FetchFailure::NotFetchable { .. } => "not_fetchable",
            FetchFailure::Persist { .. } => "persist_error",
        }
    }
}

/// Terminal result of fetching one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    FetchedOk { content: String },
    FetchFailed(FetchFailure),
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, FetchOutcome::FetchedOk { .. })
    }
}

/// Strips leading XML and DOCTYPE declarations and surrounding whitespace.
///
/// # Examples
///
/// ```
/// use gleaner_core::fetch::sanitize_content;
///
/// let raw = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<gmd:MD_Metadata/>\n";
/// assert_eq!(sanitize_content(raw), "<gmd:MD_Metadata/>");
/// ```
pub fn sanitize_content(raw: &str) -> String {
    let mut rest = raw.trim_start();
    loop {
        let stripped = if rest.starts_with("<?xml") {
            rest.find("?>").map(|end| &rest[end + 2..])
        } else if rest
            .get(..9)
            .is_some_and(|head| head.eq_ignore_ascii_case("<!doctype"))
        {
            rest.find('>').map(|end| &rest[end + 1..])
        } else {
            None
        };

        match stripped {
            Some(s) => rest = s.trim_start(),
            None => break,
        }
    }
    rest.trim_end().to_string()
}

/// Retrieves and sanitizes one record without touching the ledger.
///
/// The fallback request is sent only when the primary one raises, and at
/// most once.
pub async fn retrieve<C>(client: &C, guid: &str) -> Result<String, FetchFailure>
where
    C: RecordFetcher,
{
    if is_invalid_guid(guid) {
        return Err(FetchFailure::InvalidIdentifier {
            guid: guid.to_string(),
        });
    }

    let record = match client.fetch_primary(guid).await {
        Ok(record) => record,
        Err(primary) => {
            tracing::debug!(guid, error = %primary, "Primary request failed, trying fallback");
            client
                .fetch_fallback(guid)
                .await
                .map_err(|fallback| retrieval_failure(guid, &primary, &fallback))?
        }
    };

    let content = record
        .map(|RawRecord { content, .. }| sanitize_content(&content))
        .unwrap_or_default();

    if content.is_empty() {
        return Err(FetchFailure::EmptyRecord {
            guid: guid.to_string(),
        });
    }

    Ok(content)
}

/// Fetch stage bound to one job's client and the ledger.
pub struct FetchStage<'a, C, L> {
    client: &'a C,
    ledger: &'a L,
}

impl<'a, C, L> FetchStage<'a, C, L>
where
    C: RecordFetcher,
    L: HarvestLedger,
{
    pub fn new(client: &'a C, ledger: &'a L) -> Self {
        Self { client, ledger }
    }

    /// Fetches one pending entry and stores the result on it.
    ///
    /// A retrieval failure is written to the entry's `error`. If storing the
    /// content itself fails, the entry is left pending so a later run of the
    /// job picks it up again.
    pub async fn fetch(&self, entry: &HarvestEntry) -> FetchOutcome {
        if entry.status == EntryStatus::Deleted {
            return FetchOutcome::FetchFailed(FetchFailure::NotFetchable {
                guid: entry.guid.clone(),
            });
        }

        match retrieve(self.client, &entry.guid).await {
            Ok(content) => {
                match self
                    .ledger
                    .record_fetch(entry.id, FetchRecord::Content(content.clone()))
                    .await
                {
                    Ok(()) => FetchOutcome::FetchedOk { content },
                    Err(e) => {
                        tracing::warn!(
                            guid = entry.guid.as_str(),
                            error = %e,
                            "Failed to store fetched record"
                        );
                        FetchOutcome::FetchFailed(FetchFailure::Persist {
                            guid: entry.guid.clone(),
                            message: e.to_string(),
                        })
                    }
                }
            }
            Err(failure) => {
                tracing::warn!(
                    guid = entry.guid.as_str(),
                    reason = failure.reason(),
                    error = %failure,
                    "Fetch failed"
                );
                if let Err(e) = self
                    .ledger
                    .record_fetch(entry.id, FetchRecord::Error(failure.to_string()))
                    .await
                {
                    tracing::warn!(
                        guid = entry.guid.as_str(),
                        error = %e,
                        "Failed to store fetch error"
                    );
                }
                FetchOutcome::FetchFailed(failure)
            }
        }
    }
}

fn retrieval_failure(guid: &str, primary: &AppError, fallback: &AppError) -> FetchFailure {
    FetchFailure::Retrieval {
        guid: guid.to_string(),
        primary: primary.to_string(),
        fallback: fallback.to_string(),
    }
}
