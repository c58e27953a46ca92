//! Persistent harvest jobs.
//!
//! A job is one harvest run of one source. The job id is also the key the
//! ledger files entries under, which is what lets an interrupted job resume.
//!
//! ```text
//! pending ──► running ──► completed
//!    ▲           │
//!    │           ├──► failed     (fatal, not retryable or retries exhausted)
//!    │           ├──► cancelled  (user request)
//!    └───────────┘               (retry scheduled, or released on shutdown)
//! ```
//!
//! # Retry Strategy
//!
//! Only retryable gather failures are retried, with a growing delay:
//! 1, 5, 30 minutes, then 60 minutes for every further attempt.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SourceType;
use crate::error::AppError;
use crate::models::HarvestSource;
use crate::sync::JobResult;

// =============================================================================
// Job Status
// =============================================================================

/// Status of a harvest job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if the job will not be picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(AppError::Generic(format!("Invalid job status: {}", other))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Upper bound for any single delay.
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_delay: TimeDelta::minutes(60),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let minutes = match attempt {
            0 => return TimeDelta::zero(),
            1 => 1,
            2 => 5,
            3 => 30,
            _ => 60,
        };
        std::cmp::min(TimeDelta::minutes(minutes), self.max_delay)
    }
}

// =============================================================================
// Harvest Job
// =============================================================================

/// A harvest job as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestJob {
    pub id: Uuid,

    /// Catalog endpoint; also the ledger's source id.
    pub source_url: String,
    pub source_name: Option<String>,
    pub source_type: SourceType,
    /// Filter expression forwarded to the catalog.
    pub filter: Option<String>,
    pub disable_ssl_verification: bool,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    /// Tallies of the last run, including the fatal reason if any.
    pub result: Option<JobResult>,
    /// Worker currently holding the job.
    pub worker_id: Option<String>,
}

impl HarvestJob {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn calculate_next_retry(&self, config: &RetryConfig) -> DateTime<Utc> {
        Utc::now() + config.delay_for_attempt(self.retry_count + 1)
    }

    /// The source this job harvests.
    pub fn source(&self) -> HarvestSource {
        HarvestSource {
            url: self.source_url.clone(),
            name: self.source_name.clone(),
            source_type: self.source_type,
            filter: self.filter.clone(),
            disable_ssl_verification: self.disable_ssl_verification,
        }
    }
}

// =============================================================================
// Job Creation Request
// =============================================================================

/// Request to enqueue a harvest job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub source: HarvestSource,
    /// Uses [`RetryConfig::default`] when `None`.
    pub max_retries: Option<u32>,
}

impl CreateJobRequest {
    pub fn new(source: HarvestSource) -> Self {
        Self {
            source,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How often to poll for new jobs when the queue is empty.
    pub poll_interval: std::time::Duration,
    pub retry_config: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: std::time::Duration::from_secs(5),
            retry_config: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
