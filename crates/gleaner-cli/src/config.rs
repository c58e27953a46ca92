use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use gleaner_core::JobStatus;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "gleaner")]
#[command(
    author,
    version,
    about = "Metadata harvester for OGC CSW catalogs"
)]
#[command(after_help = "Examples:
  gleaner harvest https://catalog.example.org/csw --import-dir ./records
  gleaner harvest --source inspire
  gleaner enqueue --source inspire
  gleaner worker --import-dir ./records
  gleaner jobs --status failed
  gleaner entries 3f2c9a4e-5d7b-4c1a-9e0f-6b8d2a1c7e55 --errors-only
  gleaner cancel 3f2c9a4e-5d7b-4c1a-9e0f-6b8d2a1c7e55")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Custom path to sources.toml
    #[arg(long, env = "GLEANER_SOURCES", value_name = "PATH", global = true)]
    pub sources: Option<PathBuf>,

    /// HTTP timeout for catalog requests, in seconds
    #[arg(long, env = "GLEANER_HTTP_TIMEOUT", default_value = "30", global = true)]
    pub http_timeout: u64,

    /// Records requested per GetRecords page
    #[arg(long, env = "GLEANER_PAGE_SIZE", default_value = "10", global = true)]
    pub page_size: usize,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Harvest one catalog, or every enabled source in sources.toml
    #[command(after_help = "Examples:
  gleaner harvest                                    # All enabled sources from config
  gleaner harvest https://catalog.example.org/csw    # Single endpoint
  gleaner harvest --source inspire                   # Source by name from config
  gleaner harvest URL --filter \"AnyText like '%soil%'\"")]
    Harvest {
        /// CSW endpoint to harvest
        #[arg(value_name = "URL")]
        url: Option<String>,

        /// Harvest a source by name from sources.toml
        #[arg(short, long, value_name = "NAME", conflicts_with = "url")]
        source: Option<String>,

        /// CQL constraint forwarded to the catalog
        #[arg(short, long, value_name = "CQL")]
        filter: Option<String>,

        #[command(flatten)]
        import: ImportArgs,

        /// Entries fetched concurrently per job
        #[arg(short = 'j', long, default_value = "1")]
        concurrency: usize,

        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
    },
    /// Queue harvest jobs for workers
    Enqueue {
        /// CSW endpoint to harvest
        #[arg(value_name = "URL")]
        url: Option<String>,

        /// Queue a source by name from sources.toml
        #[arg(short, long, value_name = "NAME", conflicts_with = "url")]
        source: Option<String>,

        /// CQL constraint forwarded to the catalog
        #[arg(short, long, value_name = "CQL")]
        filter: Option<String>,

        /// Retries allowed after a connection or paging failure
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Process queued jobs until interrupted
    Worker {
        #[command(flatten)]
        import: ImportArgs,

        /// Seconds between queue polls when idle
        #[arg(long, default_value = "5")]
        poll_interval: u64,

        /// Worker identifier (random if omitted)
        #[arg(long, env = "GLEANER_WORKER_ID")]
        worker_id: Option<String>,

        /// Entries fetched concurrently per job
        #[arg(short = 'j', long, default_value = "1")]
        concurrency: usize,
    },
    /// List harvest jobs, newest first
    Jobs {
        #[arg(long)]
        status: Option<StatusFilter>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show the ledger entries and gather errors of a job
    Entries {
        #[arg(value_name = "JOB_ID")]
        job_id: uuid::Uuid,

        /// Only entries whose fetch or import failed
        #[arg(long)]
        errors_only: bool,
    },
    /// Cancel a pending or running job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        job_id: uuid::Uuid,
    },
    /// Show per-source ledger counts
    Stats,
}

#[derive(clap::Args, Debug)]
pub struct ImportArgs {
    /// Directory receiving one XML file per record
    #[arg(long, env = "GLEANER_IMPORT_DIR", default_value = "./records")]
    pub import_dir: PathBuf,
}

/// Job status accepted by `jobs --status`.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for JobStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => JobStatus::Pending,
            StatusFilter::Running => JobStatus::Running,
            StatusFilter::Completed => JobStatus::Completed,
            StatusFilter::Failed => JobStatus::Failed,
            StatusFilter::Cancelled => JobStatus::Cancelled,
        }
    }
}
