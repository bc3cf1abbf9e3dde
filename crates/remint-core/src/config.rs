//! Configuration management for remint
//!
//! Handles loading and validation of `remint.toml` configuration files.
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable configuration for the incident retyping migration.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Environment variable overriding `store.url`.
pub const ENV_STORE_URL: &str = "REMINT_STORE_URL";

/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "REMINT_LOG_LEVEL";

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "remint.toml";

/// Placeholder printed instead of secrets.
pub const REDACTED: &str = "***";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Store connection settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Migration settings
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the search cluster
    pub url: String,

    /// Indices (or `prefix*` patterns) to scan
    pub indices: Vec<String>,

    /// Records fetched per page
    pub page_size: usize,

    /// Field giving a total order for `search_after` pagination
    pub sort_field: String,

    /// Timeout for page fetches, in seconds
    pub request_timeout_secs: u64,

    /// Basic-auth username
    pub username: Option<String>,

    /// Basic-auth password
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            indices: vec!["opencti_stix_domain_objects*".to_string()],
            page_size: 500,
            sort_field: "internal_id.keyword".to_string(),
            request_timeout_secs: 60,
            username: None,
            password: None,
        }
    }
}

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Name used in logs and summaries
    pub name: String,

    /// Legacy types/classes whose records are rewritten
    pub source_types: Vec<String>,

    /// Entity type written to every matched record
    pub target_type: String,

    /// Maximum operations per bulk request
    pub max_batch_size: usize,

    /// Maximum bulk requests in flight
    pub max_concurrency: usize,

    /// Deadline for each bulk request, in seconds
    pub bulk_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            name: "migrate-incidents".to_string(),
            source_types: vec!["X-OpenCTI-Incident".to_string()],
            target_type: "Incident".to_string(),
            max_batch_size: 250,
            max_concurrency: 4,
            bulk_timeout_secs: 300,
        }
    }
}

/// Validated migration parameters consumed by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    pub name: String,
    pub indices: Vec<String>,
    pub source_types: Vec<String>,
    pub target_type: String,
    pub max_batch_size: NonZeroUsize,
    pub concurrency: NonZeroUsize,
    pub batch_timeout: Duration,
}

fn non_zero(value: usize, field: &str) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value)
        .ok_or_else(|| ConfigError::ValidationError(format!("{field} must be >= 1")))
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else `remint.toml` in the working directory if
    /// present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    Self::load_from(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Copy safe to print: `store.password` is masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.store.password.is_some() {
            config.store.password = Some(REDACTED.to_string());
        }
        config
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_STORE_URL).filter(|v| !v.trim().is_empty()) {
            self.store.url = url;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level;
        }
    }

    /// Check every invariant the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings().map(|_| ())
    }

    /// Validated migration parameters.
    pub fn settings(&self) -> Result<MigrationSettings, ConfigError> {
        let store = &self.store;
        let migration = &self.migration;

        if store.url.trim().is_empty() {
            return Err(ConfigError::ValidationError("store.url must not be empty".into()));
        }
        if store.indices.iter().all(|i| i.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "store.indices must name at least one index".into(),
            ));
        }
        non_zero(store.page_size, "store.page_size")?;
        if store.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "store.request_timeout_secs must be >= 1".into(),
            ));
        }
        if migration.source_types.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "migration.source_types must name at least one type".into(),
            ));
        }
        let target_type = migration.target_type.trim();
        if target_type.is_empty() {
            return Err(ConfigError::ValidationError(
                "migration.target_type must not be empty".into(),
            ));
        }
        if migration.source_types.iter().any(|t| t == target_type) {
            return Err(ConfigError::ValidationError(format!(
                "migration.target_type `{target_type}` is also a source type"
            )));
        }
        if migration.bulk_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "migration.bulk_timeout_secs must be >= 1".into(),
            ));
        }

        Ok(MigrationSettings {
            name: migration.name.clone(),
            indices: store.indices.clone(),
            source_types: migration.source_types.clone(),
            target_type: target_type.to_string(),
            max_batch_size: non_zero(migration.max_batch_size, "migration.max_batch_size")?,
            concurrency: non_zero(migration.max_concurrency, "migration.max_concurrency")?,
            batch_timeout: Duration::from_secs(migration.bulk_timeout_secs),
        })
    }
}
