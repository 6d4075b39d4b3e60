//! Configuration management for bucketh.
//!
//! Loads configuration from a TOML file with `BUCKETH__SECTION__KEY`
//! environment variable overrides. Every field has a default, so an empty
//! file (or no file at all) is a valid configuration.

use crate::utils::errors::{BuckethError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Location of the local dataset being backed up or restored into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Relational database file
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// How the database is snapshotted (sqlite, file)
    #[serde(default = "default_database_kind")]
    pub database_kind: DatabaseKind,

    /// Directory holding original and derived media
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    /// Optional directory of application resource files
    #[serde(default)]
    pub resources_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Extensions that make a file the original of its group, most preferred first
    #[serde(default = "default_original_extensions")]
    pub original_extensions: Vec<String>,

    /// File listing original media paths (one per line, relative to the media dir).
    /// When set, it replaces extension-based marking.
    #[serde(default)]
    pub originals_list: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Cloud provider scheme -> local mount root of its sync folder
    #[serde(default)]
    pub providers: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Entries read or written concurrently
    #[serde(default = "default_max_parallel_entries")]
    pub max_parallel_entries: usize,

    /// Compression for .bkz archives (stored, deflated, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level, method dependent
    #[serde(default)]
    pub compression_level: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock files older than this are considered abandoned
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_database() -> PathBuf {
    PathBuf::from("data/library.sqlite")
}

fn default_database_kind() -> DatabaseKind {
    DatabaseKind::Sqlite
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("data/media")
}

fn default_original_extensions() -> Vec<String> {
    ["heic", "jpg", "jpeg", "png", "mov", "mp4", "webp", "gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_parallel_entries() -> usize {
    8
}

fn default_compression() -> String {
    "deflated".to_string()
}

fn default_stale_after_secs() -> u64 {
    6 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            database_kind: default_database_kind(),
            media_dir: default_media_dir(),
            resources_dir: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            original_extensions: default_original_extensions(),
            originals_list: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallel_entries: default_max_parallel_entries(),
            compression: default_compression(),
            compression_level: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("BUCKETH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("BUCKETH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BuckethError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.max_parallel_entries == 0 {
            return Err(BuckethError::Config(
                "transfer.max_parallel_entries must be at least 1".to_string(),
            ));
        }
        match self.transfer.compression.as_str() {
            "stored" | "deflated" | "zstd" => {}
            other => {
                return Err(BuckethError::Config(format!(
                    "unknown transfer.compression '{}'",
                    other
                )))
            }
        }
        for name in self.cloud.providers.keys() {
            if name == "file" {
                return Err(BuckethError::Config(
                    "'file' is reserved for local buckets".to_string(),
                ));
            }
        }
        Ok(())
    }
}
