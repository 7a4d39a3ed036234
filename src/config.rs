//! Configuration System
//!
//! Loads configuration from a TOML file with environment variable
//! overrides. The archive engine never reads either directly; binaries
//! turn a [`Config`] into an [`ArchiveConfig`] and pass it in.

use crate::archive::ArchiveConfig;
use crate::storage::RecordLayout;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[archive]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSection {
    #[serde(default = "default_dir")]
    pub dir: String,

    #[serde(default = "default_retention_days")]
    pub retention_days: usize,

    #[serde(default)]
    pub layout: RecordLayout,

    #[serde(default = "default_settling_delay")]
    pub settling_delay_ms: i64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_cache_trim")]
    pub cache_trim: usize,

    #[serde(default = "default_index_batch")]
    pub index_batch: usize,

    #[serde(default = "default_resync_window")]
    pub resync_window: usize,

    #[serde(default = "default_outage_padding")]
    pub outage_padding_ms: i64,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_cache_retention")]
    pub cache_retention_after_period_ms: i64,
}

fn default_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("dcp-archive").to_string_lossy().to_string())
        .unwrap_or_else(|| "./dcp_archive".to_string())
}

fn default_retention_days() -> usize {
    31
}

fn default_settling_delay() -> i64 {
    30_000
}

fn default_cache_capacity() -> usize {
    25_000
}

fn default_cache_trim() -> usize {
    5_000
}

fn default_index_batch() -> usize {
    100
}

fn default_resync_window() -> usize {
    64 * 1024
}

fn default_outage_padding() -> i64 {
    15_000
}

fn default_checkpoint_interval() -> u64 {
    60
}

fn default_cache_retention() -> i64 {
    3_600_000 // 1 hour
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            retention_days: default_retention_days(),
            layout: RecordLayout::default(),
            settling_delay_ms: default_settling_delay(),
            cache_capacity: default_cache_capacity(),
            cache_trim: default_cache_trim(),
            index_batch: default_index_batch(),
            resync_window: default_resync_window(),
            outage_padding_ms: default_outage_padding(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            cache_retention_after_period_ms: default_cache_retention(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("dcp_archive={}", self.level).into());

        let registry = tracing_subscriber::registry().with(filter);
        if self.format.eq_ignore_ascii_case("json") {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, or the first default location that
    /// exists, or defaults plus environment
    ///
    /// An explicit path that fails to load is an error; a broken file in a
    /// default location is only reported.
    pub fn load_from(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_with_env(path);
        }
        Ok(Self::load_default())
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        for path in Self::default_paths() {
            if path.exists() {
                match Self::load_with_env(&path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Default config locations, in search order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("dcp-archive").join("config.toml")),
            Some(PathBuf::from("/etc/dcp-archive/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("DCP_ARCHIVE_DIR") {
            self.archive.dir = dir;
        }
        if let Some(days) = lookup("DCP_ARCHIVE_RETENTION_DAYS") {
            match days.parse() {
                Ok(d) => self.archive.retention_days = d,
                Err(_) => tracing::warn!("Ignoring bad DCP_ARCHIVE_RETENTION_DAYS {:?}", days),
            }
        }
        if let Some(level) = lookup("DCP_ARCHIVE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("DCP_ARCHIVE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Engine configuration
    pub fn to_archive_config(&self) -> ArchiveConfig {
        let a = &self.archive;
        ArchiveConfig {
            dir: expand_home(&a.dir),
            retention_days: a.retention_days,
            layout: a.layout,
            settling_delay_ms: a.settling_delay_ms,
            cache_capacity: a.cache_capacity,
            cache_trim: a.cache_trim,
            index_batch: a.index_batch.max(1),
            resync_window: a.resync_window,
            outage_padding_ms: a.outage_padding_ms,
            checkpoint_interval_secs: a.checkpoint_interval_secs,
            cache_retention_after_period_ms: a.cache_retention_after_period_ms,
        }
    }
}

fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(dir)),
        None => PathBuf::from(dir),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# DCP Archive Configuration
#
# Environment variables override these settings:
# - DCP_ARCHIVE_DIR
# - DCP_ARCHIVE_RETENTION_DAYS
# - DCP_ARCHIVE_LOG_LEVEL
# - DCP_ARCHIVE_LOG_FORMAT

[archive]
# Directory holding the period files
dir = "~/.local/share/dcp-archive"

# Number of day-periods to keep
retention_days = 31

# Record layout for new periods: legacy, extended or structured
layout = "structured"

# Real-time searches withhold entries younger than this (ms)
settling_delay_ms = 30000

# Recent index entries kept in memory for the current period
cache_capacity = 25000
cache_trim = 5000

# Index entries read per bulk read
index_batch = 100

# Bytes a record read may skip looking for the start pattern
resync_window = 65536

# Outage queries are padded by this much on both sides (ms)
outage_padding_ms = 15000

# Maintenance interval (seconds)
checkpoint_interval_secs = 60

# Finalized periods keep their cache this long past midnight (ms)
cache_retention_after_period_ms = 3600000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
