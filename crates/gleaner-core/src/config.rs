//! Configuration types for gleaner components.
//!
//! Runtime knobs (`HttpConfig`, `HarvestConfig`) use plain defaults with
//! builder-style overrides; the list of catalogs to harvest lives in an
//! optional `sources.toml` file.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::models::HarvestSource;

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// HTTP client configuration for catalog requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    /// Records requested per `GetRecords` page.
    pub page_size: usize,
    /// Extra attempts for a single identifier page after a transient failure.
    ///
    /// Record retrieval never uses this: it gets exactly one fallback.
    pub page_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            page_size: 10,
            page_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

impl HttpConfig {
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_page_retries(mut self, retries: u32) -> Self {
        self.page_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Number of entries fetched concurrently within one job.
    ///
    /// `1` keeps the fetch stage strictly sequential, in gather order.
    pub concurrency: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl HarvestConfig {
    /// Creates a new HarvestConfig with a bounded fetch worker pool.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

// =============================================================================
// Source Configuration (sources.toml)
// =============================================================================

/// Catalog protocol spoken by a source.
///
/// Determines which client implementation harvests it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// OGC Catalogue Service for the Web 2.0.2 (default).
    #[default]
    Csw,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csw => "csw",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csw" => Ok(Self::Csw),
            _ => Err(AppError::ConfigError(format!(
                "Unknown source type: '{}'. Valid options: csw",
                s
            ))),
        }
    }
}

/// Default enabled status when not specified in configuration.
fn default_enabled() -> bool {
    true
}

/// Accepts either a TOML boolean or one of the strings
/// `"true"`, `"1"`, `"yes"`, `"on"` (case-insensitive).
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => parse_flag(&s),
    })
}

/// Parses the string form of a boolean source option.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Root configuration structure for sources.toml.
///
/// # Example
///
/// ```toml
/// [[sources]]
/// name = "geodati"
/// url = "https://geodati.example.org/csw"
/// cql = "AnyText LIKE '%water%'"
///
/// [[sources]]
/// name = "staging"
/// url = "https://staging.example.org/csw"
/// disable_ssl_verification = "yes"
/// enabled = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub sources: Vec<SourceEntry>,
}

impl SourcesConfig {
    /// Returns only enabled sources.
    ///
    /// Sources with `enabled = false` are excluded from batch harvesting.
    pub fn enabled_sources(&self) -> Vec<&SourceEntry> {
        self.sources.iter().filter(|s| s.enabled).collect()
    }

    /// Find a source by name (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Option<&SourceEntry> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// A single catalog entry in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Human-readable source name, used for `--source <name>` lookup and logging.
    pub name: String,

    /// Catalog endpoint URL.
    pub url: String,

    /// Protocol; defaults to `csw`.
    #[serde(rename = "type", default)]
    pub source_type: SourceType,

    /// Whether this source is enabled for batch harvesting.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub description: Option<String>,

    /// CQL text forwarded to the catalog as a `GetRecords` constraint.
    pub cql: Option<String>,

    /// Skip TLS certificate verification for this catalog.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub disable_ssl_verification: bool,
}

impl SourceEntry {
    /// Builds the job-level source description for this entry.
    pub fn to_source(&self) -> HarvestSource {
        HarvestSource {
            url: self.url.clone(),
            name: Some(self.name.clone()),
            source_type: self.source_type,
            filter: self.cql.clone().filter(|c| !c.trim().is_empty()),
            disable_ssl_verification: self.disable_ssl_verification,
        }
    }
}

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "sources.toml";

/// Returns the default configuration directory path: `~/.config/gleaner/`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gleaner"))
}

/// Returns the default configuration file path: `~/.config/gleaner/sources.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# gleaner source configuration
#
# Usage:
#   gleaner harvest                   # Harvest all enabled sources
#   gleaner harvest --source example  # Harvest one source by name
#   gleaner harvest https://...       # Harvest a single URL (ignores this file)
#
# Set enabled = false to skip a source during batch harvest.
# cql is passed to the catalog as a GetRecords constraint.

[[sources]]
name = "example"
url = "https://demo.pycsw.org/cite/csw"
type = "csw"
description = "pycsw CITE demo catalog"
enabled = false
"#;

/// Load source configuration from a TOML file.
///
/// # Returns
/// * `Ok(Some(config))` - Configuration loaded successfully
/// * `Ok(None)` - No configuration file found at the default location
/// * `Err(e)` - Configuration file exists but is invalid, or a custom path is missing
///
/// # Behavior
/// If no configuration file exists at the default path, a template file
/// is written so users have something to edit.
pub fn load_sources_config(path: Option<PathBuf>) -> Result<Option<SourcesConfig>, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    if !config_path.exists() {
        if using_default_path {
            if let Err(e) = create_default_config(&config_path) {
                tracing::warn!("Could not create default config template: {}", e);
                return Ok(None);
            }
        } else {
            return Err(AppError::ConfigError(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    let config: SourcesConfig = toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    Ok(Some(config))
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());

    Ok(())
}
