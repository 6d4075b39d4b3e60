//! Advisory locks for buckets and local datasets.
//!
//! Two layers: an in-process registry (so tasks in one process never race)
//! and, for buckets, an exclusively-created lock file next to the bucket so
//! other processes see the backup too. Locks are released when the lease is
//! dropped.

use super::path::{BucketKind, BucketPath};
use crate::utils::errors::{BuckethError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Lock file name inside a `.bk` directory
pub const DIRECTORY_LOCK_FILE: &str = ".bucketh.lock";

/// Contents of a lock file, for humans inspecting a stuck bucket
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    host: String,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Where the on-disk lock for a bucket lives.
pub fn lock_file_path(kind: BucketKind, physical: &Path) -> PathBuf {
    match kind {
        BucketKind::Directory => physical.join(DIRECTORY_LOCK_FILE),
        BucketKind::Archive => {
            let mut name = physical.as_os_str().to_owned();
            name.push(".lock");
            PathBuf::from(name)
        }
    }
}

/// Keys currently held by this process.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashSet<String>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide registry used by engines that were not given one.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<LockRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(LockRegistry::new).clone()
    }

    /// Take the exclusive backup lock for `bucket`.
    pub fn acquire_bucket(
        self: &Arc<Self>,
        bucket: &BucketPath,
        physical: &Path,
        stale_after: Duration,
    ) -> Result<Lease> {
        let key = format!("bucket:{}", bucket);
        self.insert(&key, || BuckethError::LockContention(bucket.to_string()))?;

        let lock_file = lock_file_path(bucket.kind, physical);
        match create_lock_file(&lock_file, stale_after) {
            Ok(()) => {
                debug!("Acquired bucket lock {}", lock_file.display());
                Ok(Lease {
                    registry: Arc::clone(self),
                    key,
                    lock_file: Some(lock_file),
                })
            }
            Err(e) => {
                self.remove(&key);
                Err(e)
            }
        }
    }

    /// Take the exclusive lock on a local dataset, keyed on its media directory.
    pub fn acquire_dataset(self: &Arc<Self>, media_dir: &Path) -> Result<Lease> {
        let canonical = fs::canonicalize(media_dir).unwrap_or_else(|_| media_dir.to_path_buf());
        let key = format!("dataset:{}", canonical.display());
        self.insert(&key, || {
            BuckethError::LockContention(format!("dataset {}", media_dir.display()))
        })?;
        Ok(Lease {
            registry: Arc::clone(self),
            key,
            lock_file: None,
        })
    }

    fn insert(&self, key: &str, contention: impl FnOnce() -> BuckethError) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(key.to_string()) {
            return Err(contention());
        }
        Ok(())
    }

    fn remove(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(key);
    }
}

/// A held lock. Dropping it releases the key and deletes the lock file.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<LockRegistry>,
    key: String,
    lock_file: Option<PathBuf>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_file {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove lock file {}: {}", path.display(), e);
            }
        }
        self.registry.remove(&self.key);
    }
}

fn create_lock_file(path: &Path, stale_after: Duration) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    for attempt in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    host: hostname::get()
                        .ok()
                        .and_then(|h| h.into_string().ok())
                        .unwrap_or_else(|| "unknown".to_string()),
                    acquired_at: chrono::Utc::now(),
                };
                file.write_all(&serde_json::to_vec(&owner)?)?;
                file.sync_all()?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if attempt == 0 && is_stale(path, stale_after) {
                    warn!("Breaking stale bucket lock {}", path.display());
                    match fs::remove_file(path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                return Err(BuckethError::LockContention(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(BuckethError::LockContention(path.display().to_string()))
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}
