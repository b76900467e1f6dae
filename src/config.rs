//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.dhis-export.toml` files.

use crate::export::hierarchy::{AttributionPolicy, DEFAULT_MAX_DEPTH};
use crate::export::places::DEFAULT_PERIOD_COUNT;
use crate::export::{aggregator::DEFAULT_CONCURRENCY, AggregationPolicy};
use crate::models::ValueField;
use crate::store::CouchConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".dhis-export.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Document store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Aggregation settings.
    #[serde(default)]
    pub export: ExportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Output file path. Empty writes to stdout.
    #[serde(default)]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Pretty-print JSON output.
    #[serde(default = "default_true")]
    pub pretty: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: String::new(),
            verbose: false,
            pretty: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Where documents are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to a JSON dump file or directory.
    #[serde(default)]
    pub docs: String,

    /// CouchDB database URL.
    #[serde(default)]
    pub couch_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Documents per `_find` page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            docs: String::new(),
            couch_url: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_seconds: default_timeout(),
            page_size: default_page_size(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_page_size() -> usize {
    500
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl StoreConfig {
    /// CouchDB connection settings, if a URL is configured.
    pub fn couch(&self) -> Option<CouchConfig> {
        non_empty(&self.couch_url).map(|url| CouchConfig {
            url,
            username: non_empty(&self.username),
            password: non_empty(&self.password),
            timeout_seconds: self.timeout_seconds,
            page_size: self.page_size,
        })
    }
}

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Which mapped ancestors a target document counts toward.
    #[serde(default)]
    pub attribution: AttributionPolicy,

    /// Which target value field is summed.
    #[serde(default)]
    pub value_field: ValueField,

    /// Maximum ancestor levels walked.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Concurrent target document reads.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of periods listed in the catalog.
    #[serde(default = "default_recent_periods")]
    pub recent_periods: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            attribution: AttributionPolicy::default(),
            value_field: ValueField::default(),
            max_depth: default_max_depth(),
            concurrency: default_concurrency(),
            recent_periods: default_recent_periods(),
        }
    }
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_recent_periods() -> usize {
    DEFAULT_PERIOD_COUNT
}

impl ExportConfig {
    pub fn policy(&self) -> AggregationPolicy {
        AggregationPolicy {
            attribution: self.attribution,
            value_field: self.value_field,
            max_depth: self.max_depth,
            concurrency: self.concurrency,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        // An explicit dump path wins over a CouchDB URL, which may come from the environment.
        if let Some(ref url) = args.couch_url {
            self.store.couch_url = url.clone();
            self.store.docs.clear();
        }
        if let Some(ref docs) = args.docs {
            self.store.docs = docs.display().to_string();
            self.store.couch_url.clear();
        }
        if let Some(timeout) = args.timeout {
            self.store.timeout_seconds = timeout;
        }

        if let Some(attribution) = args.attribution {
            self.export.attribution = attribution;
        }
        if let Some(concurrency) = args.concurrency {
            self.export.concurrency = concurrency;
        }
        if let Some(periods) = args.periods {
            self.export.recent_periods = periods;
        }

        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if args.compact {
            self.general.pretty = false;
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Reject settings that would make an export silently wrong or hang.
    pub fn validate(&self) -> Result<()> {
        if self.store.page_size == 0 {
            bail!("[store] page_size must be at least 1");
        }
        if self.store.timeout_seconds == 0 {
            bail!("[store] timeout_seconds must be at least 1");
        }
        if self.export.concurrency == 0 {
            bail!("[export] concurrency must be at least 1");
        }
        if self.export.max_depth == 0 {
            bail!("[export] max_depth must be at least 1");
        }
        Ok(())
    }

    /// Log level after merging: quiet wins, then verbose.
    pub fn log_level(&self, quiet: bool) -> tracing::Level {
        if quiet {
            tracing::Level::ERROR
        } else if self.general.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
