//! Filesystem importer.
//!
//! Writes each fetched record to `<dir>/<id>.xml`, where `id` is the hex
//! SHA-256 of `source_id` and `guid` joined by a newline, and removes the
//! file again when the record is deleted upstream. The id doubles as the
//! local entity id stored in the ledger.
//!
//! Records are written to a temporary file in the same directory and renamed
//! into place, so a reader never sees a partially written record.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EntryStatus, ImportOutcome, ImportRequest};
use crate::traits::Importer;

/// Importer that mirrors harvested records into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryImporter {
    root: PathBuf,
}

impl DirectoryImporter {
    /// Creates an importer writing below `root`; the directory is created on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable local id for a record of a source.
    pub fn entity_id(source_id: &str, guid: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(guid.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, entity_id: &str) -> PathBuf {
        self.root.join(format!("{}.xml", entity_id))
    }

    async fn write_atomic(
        &self,
        entity_id: &str,
        path: &Path,
        content: &str,
    ) -> Result<(), AppError> {
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", entity_id, Uuid::new_v4().simple()));

        let written = match tokio::fs::write(&tmp, content).await {
            Ok(()) => tokio::fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Best effort cleanup.
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Importer for DirectoryImporter {
    async fn import(&self, request: ImportRequest<'_>) -> Result<ImportOutcome, AppError> {
        let entity_id = match request.local_entity_id {
            Some(id) => id.to_string(),
            None => Self::entity_id(request.source_id, request.guid),
        };
        let path = self.path_for(&entity_id);

        if request.status == EntryStatus::Deleted {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(guid = request.guid, "Deleted record had no local file");
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(ImportOutcome {
                local_entity_id: Some(entity_id),
            });
        }

        let content = request.content.ok_or_else(|| {
            AppError::Generic(format!("No content to import for GUID {}", request.guid))
        })?;

        tokio::fs::create_dir_all(&self.root).await?;
        self.write_atomic(&entity_id, &path, content).await?;
        tracing::debug!(guid = request.guid, path = %path.display(), "Record imported");

        Ok(ImportOutcome {
            local_entity_id: Some(entity_id),
        })
    }
}
