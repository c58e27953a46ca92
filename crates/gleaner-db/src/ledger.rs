//! Harvest ledger for PostgreSQL.
//!
//! The single-current rule is enforced twice: `commit_gather` flips old
//! entries inside the same transaction that inserts the new ones, and the
//! partial unique index `uq_harvest_entries_current` rejects anything that
//! slips past it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use gleaner_core::error::AppError;
use gleaner_core::models::{
    FetchRecord, GatherBatch, GatherErrorRecord, HarvestEntry, ImportRecord,
};
use gleaner_core::traits::HarvestLedger;

const ENTRY_COLUMNS: &str = "id, seq, job_id, source_id, guid, status, current, local_entity_id, content, error, created_at, fetched_at, imported_at, import_error";

/// PostgreSQL implementation of [`HarvestLedger`].
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use gleaner_db::LedgerRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/gleaner")
///     .await?;
///
/// gleaner_db::migrate(&pool).await?;
/// let ledger = LedgerRepository::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LedgerRepository {
    pool: Pool<Postgres>,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Entry counts per source, for inspection.
    pub async fn source_stats(&self) -> Result<Vec<SourceStats>, AppError> {
        let rows: Vec<SourceStats> = sqlx::query_as(
            r#"
            SELECT
                source_id,
                COUNT(*) FILTER (WHERE current) AS current,
                COUNT(*) FILTER (WHERE status <> 'deleted' AND content IS NULL AND error IS NULL) AS pending,
                COUNT(*) FILTER (WHERE error IS NOT NULL) AS failed,
                MAX(created_at) AS last_gathered_at
            FROM harvest_entries
            GROUP BY source_id
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Aggregate ledger counts for one source.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceStats {
    pub source_id: String,
    pub current: i64,
    pub pending: i64,
    pub failed: i64,
    pub last_gathered_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    seq: i64,
    job_id: Uuid,
    source_id: String,
    guid: String,
    status: String,
    current: bool,
    local_entity_id: Option<String>,
    content: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    fetched_at: Option<DateTime<Utc>>,
    imported_at: Option<DateTime<Utc>>,
    import_error: Option<String>,
}

impl TryFrom<EntryRow> for HarvestEntry {
    type Error = AppError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            guid: row.guid,
            job_id: row.job_id,
            source_id: row.source_id,
            local_entity_id: row.local_entity_id,
            status: row.status.parse()?,
            current: row.current,
            content: row.content,
            error: row.error,
            created_at: row.created_at,
            fetched_at: row.fetched_at,
            imported_at: row.imported_at,
            import_error: row.import_error,
        })
    }
}

fn into_entries(mut rows: Vec<EntryRow>) -> Result<Vec<HarvestEntry>, AppError> {
    rows.sort_by_key(|row| row.seq);
    rows.into_iter().map(HarvestEntry::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct CurrentRow {
    guid: String,
    local_entity_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct GatherErrorRow {
    job_id: Uuid,
    message: String,
    created_at: DateTime<Utc>,
}

impl From<GatherErrorRow> for GatherErrorRecord {
    fn from(row: GatherErrorRow) -> Self {
        Self {
            job_id: row.job_id,
            message: row.message,
            created_at: row.created_at,
        }
    }
}

/// Column-wise arrays for a single `UNNEST` insert.
#[derive(Default)]
struct EntryColumns {
    guids: Vec<String>,
    statuses: Vec<String>,
    local_ids: Vec<Option<String>>,
    current: Vec<bool>,
}

impl EntryColumns {
    fn from_batch(batch: &GatherBatch) -> Self {
        let mut columns = Self::default();
        for entry in &batch.entries {
            columns.guids.push(entry.guid.clone());
            columns.statuses.push(entry.status.as_str().to_string());
            columns.local_ids.push(entry.local_entity_id.clone());
            columns.current.push(entry.current);
        }
        columns
    }
}

// =============================================================================
// HarvestLedger Trait Implementation
// =============================================================================

impl HarvestLedger for LedgerRepository {
    async fn current_entries(
        &self,
        source_id: &str,
    ) -> Result<HashMap<String, Option<String>>, AppError> {
        let rows: Vec<CurrentRow> = sqlx::query_as(
            r#"
            SELECT guid, local_entity_id
            FROM harvest_entries
            WHERE source_id = $1 AND current
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.guid, row.local_entity_id))
            .collect())
    }

    async fn current_entry(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Option<HarvestEntry>, AppError> {
        let query = format!(
            "SELECT {} FROM harvest_entries WHERE source_id = $1 AND guid = $2 AND current",
            ENTRY_COLUMNS
        );
        let row: Option<EntryRow> = sqlx::query_as(&query)
            .bind(source_id)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;

        row.map(HarvestEntry::try_from).transpose()
    }

    async fn commit_gather(&self, batch: GatherBatch) -> Result<Vec<HarvestEntry>, AppError> {
        if batch.entries.is_empty() {
            return Ok(Vec::new());
        }

        let superseded: Vec<String> = batch.superseded_guids().map(str::to_string).collect();
        let columns = EntryColumns::from_batch(&batch);

        let mut tx = self.pool.begin().await?;

        // Flips must land before the inserts or the partial unique index fires.
        if !superseded.is_empty() {
            let flipped = sqlx::query(
                r#"
                UPDATE harvest_entries
                SET current = FALSE
                WHERE source_id = $1 AND current AND guid = ANY($2)
                "#,
            )
            .bind(&batch.source_id)
            .bind(&superseded)
            .execute(&mut *tx)
            .await?;

            tracing::debug!(
                source = batch.source_id.as_str(),
                flipped = flipped.rows_affected(),
                "Superseded current entries"
            );
        }

        let query = format!(
            r#"
            INSERT INTO harvest_entries (job_id, source_id, guid, status, local_entity_id, current)
            SELECT $1, $2, t.guid, t.status, t.local_entity_id, t.current
            FROM UNNEST($3::text[], $4::text[], $5::text[], $6::bool[])
                WITH ORDINALITY AS t(guid, status, local_entity_id, current, ord)
            ORDER BY t.ord
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&query)
            .bind(batch.job_id)
            .bind(&batch.source_id)
            .bind(&columns.guids)
            .bind(&columns.statuses)
            .bind(&columns.local_ids)
            .bind(&columns.current)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        into_entries(rows)
    }

    async fn record_fetch(&self, entry_id: Uuid, record: FetchRecord) -> Result<(), AppError> {
        let (content, error) = match record {
            FetchRecord::Content(content) => (Some(content), None),
            FetchRecord::Error(error) => (None, Some(error)),
        };

        let result = sqlx::query(
            r#"
            UPDATE harvest_entries
            SET content = $2, error = $3, fetched_at = NOW()
            WHERE id = $1
              AND status <> 'deleted'
              AND content IS NULL
              AND error IS NULL
            "#,
        )
        .bind(entry_id)
        .bind(content)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM harvest_entries WHERE id = $1")
                    .bind(entry_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => AppError::EntryNotPending(entry_id),
                None => AppError::EntryNotFound(entry_id),
            });
        }

        Ok(())
    }

    async fn record_import(&self, entry_id: Uuid, record: ImportRecord) -> Result<(), AppError> {
        let result = match record {
            ImportRecord::Imported { local_entity_id } => {
                sqlx::query(
                    r#"
                    UPDATE harvest_entries
                    SET
                        imported_at = NOW(),
                        import_error = NULL,
                        local_entity_id = COALESCE($2, local_entity_id)
                    WHERE id = $1
                    "#,
                )
                .bind(entry_id)
                .bind(local_entity_id)
                .execute(&self.pool)
                .await?
            }
            ImportRecord::Failed(error) => {
                sqlx::query("UPDATE harvest_entries SET import_error = $2 WHERE id = $1")
                    .bind(entry_id)
                    .bind(error)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(AppError::EntryNotFound(entry_id));
        }
        Ok(())
    }

    async fn record_gather_error(&self, job_id: Uuid, message: &str) -> Result<(), AppError> {
        sqlx::query("INSERT INTO harvest_gather_errors (job_id, message) VALUES ($1, $2)")
            .bind(job_id)
            .bind(message)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn gather_errors(&self, job_id: Uuid) -> Result<Vec<GatherErrorRecord>, AppError> {
        let rows: Vec<GatherErrorRow> = sqlx::query_as(
            r#"
            SELECT job_id, message, created_at
            FROM harvest_gather_errors
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<HarvestEntry>, AppError> {
        let query = format!(
            "SELECT {} FROM harvest_entries WHERE job_id = $1 ORDER BY seq",
            ENTRY_COLUMNS
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        into_entries(rows)
    }
}
