//! Gleaner Core - harvest ledger, pipeline stages and job services.
//!
//! Gleaner mirrors a remote metadata catalog into a local store in three
//! passes per job:
//!
//! - **Gather**: list every identifier the catalog exposes and reconcile it
//!   against the ledger into `new`, `changed` and `deleted` entries
//! - **Fetch**: retrieve the raw record of each pending entry, with exactly
//!   one fallback request per entry
//! - **Import**: hand fetched and deleted entries to an [`Importer`]
//!
//! # Architecture
//!
//! Protocol, storage and import are decoupled through traits so the same
//! pipeline runs against a real catalog and PostgreSQL or against mocks:
//!
//! - [`SourceClientFactory`] / [`IdentifierSource`] / [`RecordFetcher`] - catalog access (e.g., CSW)
//! - [`HarvestLedger`] - durable entry store (e.g., PostgreSQL)
//! - [`Importer`] - downstream consumer (e.g., [`DirectoryImporter`])
//! - [`JobQueue`] - persistent jobs for [`WorkerService`]
//!
//! # Example
//!
//! ```ignore
//! use gleaner_core::{HarvestPipeline, HarvestSource, TracingReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = HarvestPipeline::new(csw_factory, ledger, importer);
//! let result = pipeline
//!     .run_job_cancellable(job_id, &source, &TracingReporter, CancellationToken::new())
//!     .await;
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod gather;
pub mod guid;
pub mod import;
pub mod job;
pub mod job_queue;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod sync;
pub mod traits;
pub mod worker;

// Configuration
pub use config::{
    DbConfig, HarvestConfig, HttpConfig, SourceEntry, SourceType, SourcesConfig,
    default_config_path, load_sources_config,
};

// Error handling
pub use error::AppError;

// Domain models
pub use models::{
    EntryStatus, FetchRecord, FetchState, GatherBatch, GatherErrorRecord, HarvestEntry,
    HarvestSource, IdentifierError, ImportOutcome, ImportRecord, ImportRequest, NewEntry,
    RawRecord,
};

// Stages and business logic
pub use fetch::{FetchFailure, FetchOutcome, FetchStage, sanitize_content};
pub use gather::{GatherFailure, GatherOutcome, GatherStage};
pub use guid::is_invalid_guid;
pub use reconcile::{Reconciliation, reconcile};
pub use sync::{BatchHarvestSummary, EntryReport, JobResult, SourceHarvestResult, StepOutcome};

// Progress reporting
pub use progress::{HarvestEvent, ProgressReporter, SilentReporter, TracingReporter};

// Traits for dependency injection
pub use traits::{HarvestLedger, IdentifierSource, Importer, RecordFetcher, SourceClientFactory};

// Services
pub use import::DirectoryImporter;
pub use pipeline::HarvestPipeline;

// Job queue types
pub use job::{CreateJobRequest, HarvestJob, JobStatus, RetryConfig, WorkerConfig};
pub use job_queue::JobQueue;

// Worker service
pub use worker::{
    SilentWorkerReporter, TracingWorkerReporter, WorkerEvent, WorkerReporter, WorkerService,
};
