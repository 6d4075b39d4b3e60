//! Uniform access to bucket storage.
//!
//! Backup and restore only ever talk to a [`BucketArchive`]. Which backend
//! sits behind it is decided once, by [`open_bucket`], from the resolved
//! [`BucketPath`].

pub mod directory;
pub mod zipped;

use crate::bucket::{BucketKind, BucketPath};
use crate::config::Config;
use crate::utils::errors::{BuckethError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub use directory::{DirectoryBackend, ROLLBACK_DIR};
pub use zipped::ZipBackend;

/// Entry-level storage contract shared by both backends.
#[async_trait]
pub trait BucketArchive: Send + Sync {
    fn kind(&self) -> BucketKind;

    /// Every entry path, sorted
    async fn list(&self) -> Result<Vec<String>>;

    /// Entry bytes, or `NotFound`
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Store an entry. A reader never observes a partially written entry.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Remove an entry; removing a missing entry is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Commit everything written since the last `finalize`.
    async fn finalize(&self) -> Result<()>;

    /// Undo everything written since the last `finalize`.
    async fn abort(&self) -> Result<()>;
}

/// Open the backend for `bucket`.
pub async fn open_bucket(bucket: &BucketPath, config: &Config) -> Result<Arc<dyn BucketArchive>> {
    let physical = bucket.physical_path(&config.cloud)?;
    debug!("Opening {} at {}", bucket, physical.display());

    match bucket.kind {
        BucketKind::Directory => Ok(Arc::new(DirectoryBackend::with_rollback(physical))),
        BucketKind::Archive => {
            let backend = ZipBackend::open(physical, &config.transfer).await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Reject entry paths that could escape the bucket or collide across platforms.
pub fn validate_entry_path(path: &str) -> Result<()> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains('\\')
        || path.contains('\0')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(BuckethError::InvalidEntryPath(path.to_string()));
    }
    Ok(())
}
