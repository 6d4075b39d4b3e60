//! Error types for bucket backup and restore.

use crate::executor::restore::RestoreReport;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuckethError {
    #[error("Invalid bucket path kind: {0} (expected a .bk or .bkz suffix)")]
    InvalidPathKind(String),

    #[error("Unsupported bucket scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Ambiguous media root: '{first}' and '{second}' are both marked original")]
    AmbiguousRoot { first: String, second: String },

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Integrity mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("No manifest in bucket: {0}")]
    ManifestMissing(String),

    #[error("Backup aborted while writing {path}: {source}")]
    PartialWriteAborted {
        path: String,
        #[source]
        source: Box<BuckethError>,
    },

    #[error("Bucket is locked by another backup: {0}")]
    LockContention(String),

    #[error("Stale bucket generation: expected {expected}, bucket is at {found}")]
    StaleGeneration { expected: u64, found: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Restore incomplete: {}", .0.summary())]
    RestoreIncomplete(Box<RestoreReport>),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid entry path: {0}")]
    InvalidEntryPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<config::ConfigError> for BuckethError {
    fn from(err: config::ConfigError) -> Self {
        BuckethError::Config(err.to_string())
    }
}

impl BuckethError {
    /// True for a missing entry, whether reported by a backend or by the OS.
    pub fn is_not_found(&self) -> bool {
        match self {
            BuckethError::NotFound(_) => true,
            BuckethError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuckethError>;
