use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types.
///
/// This enum represents the errors that can surface from the library crates.
/// Expected per-record failures (a record that cannot be retrieved, an
/// identifier that looks like a paging error) are *not* modelled here: the
/// harvest stages return typed outcomes for those and only fall back to
/// `AppError` for infrastructure problems.
///
/// # Error Conversion
///
/// Most errors automatically convert from their source types using the `#[from]` attribute:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use gleaner_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::Generic("Something went wrong".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// This error wraps all errors from SQLx database operations, including
    /// connection failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client request failed.
    ///
    /// This error occurs when HTTP requests fail due to network issues,
    /// timeouts, or non-success status codes returned by the catalog.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid catalog endpoint URL provided.
    ///
    /// This error occurs when the configured source URL is malformed
    /// or cannot be used to construct valid request URLs.
    #[error("Invalid source URL: {0}")]
    InvalidSourceUrl(String),

    /// The catalog answered with a successful status but no usable body.
    #[error("Empty response from catalog")]
    EmptyResponse,

    /// The catalog answered with an OWS exception report.
    ///
    /// Carries the `ExceptionText` (or the exception code when no text is given).
    #[error("Catalog exception: {0}")]
    CatalogException(String),

    /// The catalog response could not be parsed as XML.
    #[error("Malformed XML: {0}")]
    XmlError(String),

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Configuration file error.
    ///
    /// This error occurs when reading or parsing the configuration file fails,
    /// such as when sources.toml is malformed or contains invalid values.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A ledger entry already carries fetch results.
    ///
    /// Entries are append-only once `content` or `error` is set; a second
    /// write attempt is rejected rather than overwriting history.
    #[error("Harvest entry {0} is not pending")]
    EntryNotPending(Uuid),

    /// A ledger entry referenced by id does not exist.
    #[error("Harvest entry not found: {0}")]
    EntryNotFound(Uuid),

    /// A harvest job referenced by id does not exist.
    #[error("Harvest job not found: {0}")]
    JobNotFound(Uuid),

    /// Local filesystem operation failed (importer output, config templates).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic application error for cases not covered by specific variants.
    ///
    /// Use this sparingly - prefer creating specific error variants
    /// for better error handling and debugging.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Try: docker-compose up -d".to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ClientError(msg) => {
                if msg.contains("timeout") || msg.contains("timed out") {
                    "Request timed out. The catalog may be slow or unreachable.\n   Try again later or check the source URL.".to_string()
                } else if msg.contains("connect") {
                    format!(
                        "Cannot connect to catalog: {}\n   Check your internet connection and the source URL.",
                        msg
                    )
                } else {
                    format!("Catalog API error: {}", msg)
                }
            }
            AppError::InvalidSourceUrl(url) => {
                format!(
                    "Invalid source URL: {}\n   Example: https://geo.example.org/csw",
                    url
                )
            }
            AppError::CatalogException(msg) => {
                format!(
                    "The catalog rejected the request: {}\n   Check the CQL filter and the endpoint.",
                    msg
                )
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The server may be overloaded. Try again later.",
                    secs
                )
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::EmptyResponse => {
                "The catalog returned no data. It may be temporarily unavailable.".to_string()
            }
            AppError::ConfigError(msg) => {
                format!(
                    "Configuration error: {}\n   Check your configuration file.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_core::error::AppError;
    ///
    /// // Network errors are retryable
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// // A malformed document will not improve on the next attempt
    /// let err = AppError::XmlError("unexpected EOF".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ClientError(_)
        )
    }
}
