//! Gleaner DB - PostgreSQL persistence for the harvest ledger and job queue
//!
//! # Overview
//!
//! The main components are:
//! - [`LedgerRepository`] - harvest entries and gather errors
//! - [`JobRepository`] - Persistent job queue for harvest tasks
//! - [`migrate`] - applies the schema in `migrations/`

mod job_repository;
mod ledger;

pub use job_repository::JobRepository;
pub use ledger::{LedgerRepository, SourceStats};

use gleaner_core::error::AppError;
use sqlx::PgPool;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Applies pending schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), AppError> {
    MIGRATOR.run(pool).await.map_err(sqlx::Error::from)?;
    tracing::debug!("Database schema up to date");
    Ok(())
}
