//! Configuration management
//!
//! Pipeline tuning comes from the environment (after `.env`); the set of
//! sources comes from a TOML file with `ETL_SOURCES__*` overrides.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::WatermarkType;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default path of the source definitions file.
pub const DEFAULT_SOURCES_FILE: &str = "sources.toml";

/// Default number of items per load transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default cap on unprocessed raw records swept per run.
pub const DEFAULT_SWEEP_LIMIT: i64 = 1000;

/// Default cap on per-record failures kept in a run's error details.
pub const DEFAULT_MAX_ERROR_DETAILS: usize = 100;

/// Default scheduler interval in seconds (30 minutes).
pub const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 1800;

/// Default wall-clock limit for a single run in seconds.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3600;

/// Default attempts per HTTP request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================================================
// Source Configuration Constants
// ============================================================================

/// Longest accepted source name.
pub const MAX_SOURCE_NAME_LEN: usize = 100;

/// Default page size assumed for list-shaped API responses.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default upper bound on pages fetched per run.
pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// Default HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default base backoff delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Default cap on a single backoff sleep in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Default consecutive failures before the circuit breaker opens.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;

/// Default circuit breaker cooldown in seconds.
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 60;

/// Pipeline-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sources_file: PathBuf,
    pub batch_size: usize,
    pub sweep_limit: i64,
    pub max_error_details: usize,
    pub schedule_interval_secs: u64,
    pub run_timeout_secs: u64,
    pub max_retries: u32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from(DEFAULT_SOURCES_FILE),
            batch_size: DEFAULT_BATCH_SIZE,
            sweep_limit: DEFAULT_SWEEP_LIMIT,
            max_error_details: DEFAULT_MAX_ERROR_DETAILS,
            schedule_interval_secs: DEFAULT_SCHEDULE_INTERVAL_SECS,
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = PipelineConfig {
            sources_file: std::env::var("ETL_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOURCES_FILE)),
            batch_size: std::env::var("ETL_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            sweep_limit: std::env::var("ETL_SWEEP_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SWEEP_LIMIT),
            max_error_details: std::env::var("ETL_MAX_ERROR_DETAILS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_ERROR_DETAILS),
            schedule_interval_secs: std::env::var("ETL_SCHEDULE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SCHEDULE_INTERVAL_SECS),
            run_timeout_secs: std::env::var("ETL_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS),
            max_retries: std::env::var("ETL_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRIES),
            api_key: std::env::var("ETL_API_KEY").ok().filter(|k| !k.is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.sweep_limit <= 0 {
            anyhow::bail!("Sweep limit must be greater than 0");
        }

        if self.schedule_interval_secs == 0 {
            anyhow::bail!("Schedule interval must be greater than 0");
        }

        if self.run_timeout_secs == 0 {
            anyhow::bail!("Run timeout must be greater than 0");
        }

        if self.max_retries == 0 {
            anyhow::bail!("Max retries must be at least 1");
        }

        Ok(())
    }
}

/// One configured source, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Api(ApiSourceConfig),
    File(FileSourceConfig),
    Feed(FeedSourceConfig),
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Api(c) => &c.name,
            SourceConfig::File(c) => &c.name,
            SourceConfig::Feed(c) => &c.name,
        }
    }
}

/// Paginated JSON API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default = "default_api_watermark_type")]
    pub watermark_type: WatermarkType,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    /// Falls back to `ETL_MAX_RETRIES` when unset
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

impl ApiSourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_key: None,
            id_field: default_id_field(),
            timestamp_field: default_timestamp_field(),
            watermark_type: default_api_watermark_type(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_retries: None,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            breaker_cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
        }
    }
}

/// Delimited file on local disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSourceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_id_field")]
    pub id_column: String,
    /// When set, the watermark is a timestamp read from this column
    #[serde(default)]
    pub timestamp_column: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl FileSourceConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            id_column: default_id_field(),
            timestamp_column: None,
            delimiter: default_delimiter(),
        }
    }
}

/// RSS or Atom feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl FeedSourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_timestamp_field() -> String {
    "created_at".to_string()
}

fn default_api_watermark_type() -> WatermarkType {
    WatermarkType::Timestamp
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_breaker_threshold() -> u32 {
    DEFAULT_BREAKER_THRESHOLD
}

fn default_breaker_cooldown_secs() -> u64 {
    DEFAULT_BREAKER_COOLDOWN_SECS
}

fn default_delimiter() -> char {
    ','
}

/// Contents of the sources file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl SourcesConfig {
    /// Load source definitions from `path`, layering `ETL_SOURCES__*`
    /// environment overrides on top. A missing file yields no sources.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("ETL_SOURCES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read sources file {}", path.display()))?;

        let sources: SourcesConfig = settings
            .try_deserialize()
            .with_context(|| format!("Invalid source definitions in {}", path.display()))?;

        sources.validate()?;

        Ok(sources)
    }

    /// Parse source definitions from TOML text.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .context("Failed to parse source definitions")?;

        let sources: SourcesConfig = settings
            .try_deserialize()
            .context("Invalid source definitions")?;

        sources.validate()?;

        Ok(sources)
    }

    pub fn find(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name() == name)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();

        for source in &self.sources {
            let name = source.name();
            if name.trim().is_empty() {
                anyhow::bail!("Source name cannot be empty");
            }
            if name.chars().count() > MAX_SOURCE_NAME_LEN {
                anyhow::bail!("Source name exceeds {} characters: {}", MAX_SOURCE_NAME_LEN, name);
            }
            if !seen.insert(name) {
                anyhow::bail!("Duplicate source name: {}", name);
            }

            match source {
                SourceConfig::Api(api) => {
                    validate_http_url(name, &api.url)?;
                    if api.page_size == 0 {
                        anyhow::bail!("Source {}: page_size must be greater than 0", name);
                    }
                    if api.max_pages == 0 {
                        anyhow::bail!("Source {}: max_pages must be greater than 0", name);
                    }
                    if api.max_retries == Some(0) {
                        anyhow::bail!("Source {}: max_retries must be at least 1", name);
                    }
                    if api.breaker_threshold == 0 {
                        anyhow::bail!("Source {}: breaker_threshold must be greater than 0", name);
                    }
                    if api.id_field.is_empty() || api.timestamp_field.is_empty() {
                        anyhow::bail!("Source {}: id_field and timestamp_field cannot be empty", name);
                    }
                },
                SourceConfig::File(file) => {
                    if file.path.as_os_str().is_empty() {
                        anyhow::bail!("Source {}: path cannot be empty", name);
                    }
                    if !file.delimiter.is_ascii() {
                        anyhow::bail!("Source {}: delimiter must be a single ASCII character", name);
                    }
                    if file.id_column.is_empty() {
                        anyhow::bail!("Source {}: id_column cannot be empty", name);
                    }
                },
                SourceConfig::Feed(feed) => validate_http_url(name, &feed.url)?,
            }
        }

        Ok(())
    }
}

fn validate_http_url(name: &str, raw: &str) -> anyhow::Result<()> {
    let parsed = url::Url::parse(raw).with_context(|| format!("Source {}: invalid URL {}", name, raw))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("Source {}: URL must use http or https, got {}", name, parsed.scheme());
    }
    Ok(())
}
