//! Bucketh Library
//!
//! Snapshots a local dataset (a database plus a tree of original and
//! derived media) into a portable bucket, either a `.bk` directory tree or a
//! `.bkz` zip archive, and restores it back.

pub mod archive;
pub mod bucket;
pub mod config;
pub mod dataset;
pub mod events;
pub mod executor;
pub mod fs;
pub mod media;
pub mod progress;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use dataset::LocalDataset;
pub use executor::{
    BackupEngine, BackupRequest, BackupResult, EngineContext, RestoreEngine, RestoreResult,
    VerifyReport,
};
pub use utils::errors::{BuckethError, Result};
