//! `.bk` buckets: a plain directory tree.
//!
//! Each write lands in a temp file beside its destination and is renamed
//! into place, so a concurrent reader sees either the old entry or the new
//! one.
//!
//! A backend opened with [`DirectoryBackend::with_rollback`] also moves every
//! entry it is about to overwrite into a rollback area inside the bucket.
//! `abort` puts those entries back and removes the ones this session
//! created; `finalize` drops the rollback area.

use super::{validate_entry_path, BucketArchive};
use crate::bucket::lock::DIRECTORY_LOCK_FILE;
use crate::bucket::BucketKind;
use crate::fs::walker::{walk_directory, WalkOptions, TEMP_PREFIX};
use crate::utils::errors::{BuckethError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tracing::{debug, info, warn};

/// Holds displaced entries until the session commits or aborts. Hidden from
/// `list` by its temp prefix.
pub const ROLLBACK_DIR: &str = ".bucketh-rollback";

#[derive(Debug, Default)]
struct Journal {
    /// Entries moved into the rollback area before being overwritten
    displaced: BTreeSet<String>,
    /// Entries that did not exist before this session
    created: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
    journal: Option<Arc<StdMutex<Journal>>>,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            journal: None,
        }
    }

    /// A backend whose writes can be undone by `abort` until `finalize`.
    pub fn with_rollback(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            journal: Some(Arc::new(StdMutex::new(Journal::default()))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, path: &str) -> Result<PathBuf> {
        validate_entry_path(path)?;
        Ok(self.root.join(path))
    }
}

fn lock_journal(journal: &StdMutex<Journal>) -> Result<MutexGuard<'_, Journal>> {
    journal
        .lock()
        .map_err(|_| BuckethError::Io(std::io::Error::other("rollback journal lock poisoned")))
}

/// Move the current version of `name` into the rollback area, once per
/// session. Returns whether the entry is new to the bucket.
fn set_aside(root: &Path, name: &str, full: &Path, journal: &mut Journal) -> Result<bool> {
    if journal.displaced.contains(name) || journal.created.contains(name) {
        return Ok(false);
    }
    match std::fs::symlink_metadata(full) {
        Ok(meta) if meta.is_file() => {
            let aside = root.join(ROLLBACK_DIR).join(name);
            if let Some(parent) = aside.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(full, &aside)?;
            journal.displaced.insert(name.to_string());
            Ok(false)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Remove directories left empty under `root` after `removed` went away.
fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut dir = removed.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

fn remove_rollback_area(root: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(root.join(ROLLBACK_DIR)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Undo a session: displaced entries go back, created ones are removed.
/// Keeps going past individual failures and reports the first.
fn roll_back(root: &Path, journal: &mut Journal) -> Result<(usize, usize)> {
    let aside = root.join(ROLLBACK_DIR);
    let mut first_error: Option<std::io::Error> = None;

    let displaced = std::mem::take(&mut journal.displaced);
    for name in &displaced {
        if let Err(e) = std::fs::rename(aside.join(name), root.join(name)) {
            first_error.get_or_insert(e);
        }
    }
    let created = std::mem::take(&mut journal.created);
    for name in &created {
        let full = root.join(name);
        match std::fs::remove_file(&full) {
            Ok(()) => prune_empty_parents(root, &full),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e.into());
    }
    remove_rollback_area(root)?;
    Ok((displaced.len(), created.len()))
}

#[async_trait]
impl BucketArchive for DirectoryBackend {
    fn kind(&self) -> BucketKind {
        BucketKind::Directory
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut options = WalkOptions::default();
            options.follow_links = false;
            options.exclude_names.push(DIRECTORY_LOCK_FILE.to_string());
            walk_directory(&root, &options)
        })
        .await??;

        Ok(files.into_iter().map(|f| f.relative_path).collect())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let full = self.entry_path(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BuckethError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full = self.entry_path(path)?;
        let root = self.root.clone();
        let journal = self.journal.clone();
        let name = path.to_string();
        let len = data.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let parent = full
                .parent()
                .ok_or_else(|| BuckethError::InvalidEntryPath(full.display().to_string()))?;
            std::fs::create_dir_all(parent)?;

            let mut staged = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(parent)?;
            staged.write_all(&data)?;
            staged.as_file().sync_all()?;

            match journal {
                Some(journal) => {
                    let mut journal = lock_journal(&journal)?;
                    let fresh = set_aside(&root, &name, &full, &mut journal)?;
                    staged.persist(&full).map_err(|e| BuckethError::Io(e.error))?;
                    if fresh {
                        journal.created.insert(name);
                    }
                }
                None => {
                    staged.persist(&full).map_err(|e| BuckethError::Io(e.error))?;
                }
            }
            Ok(())
        })
        .await??;

        debug!("Wrote {} ({} bytes)", path, len);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.entry_path(path)?;
        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || match std::fs::remove_file(&full) {
            Ok(()) => {
                prune_empty_parents(&root, &full);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })
        .await??;

        if removed {
            debug!("Deleted {}", path);
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let Some(journal) = self.journal.clone() else {
            return Ok(());
        };
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut journal = lock_journal(&journal)?;
            *journal = Journal::default();
            if let Err(e) = remove_rollback_area(&root) {
                warn!("Failed to remove rollback area in {}: {}", root.display(), e);
            }
            Ok(())
        })
        .await?
    }

    async fn abort(&self) -> Result<()> {
        let Some(journal) = self.journal.clone() else {
            return Ok(());
        };
        let root = self.root.clone();
        let (restored, removed) = tokio::task::spawn_blocking(move || {
            let mut journal = lock_journal(&journal)?;
            roll_back(&root, &mut journal)
        })
        .await??;

        info!(
            "Rolled back {}: {} entries restored, {} removed",
            self.root.display(),
            restored,
            removed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let temp = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(temp.path().join("photos.bk"));

        backend
            .write("media/2024/car.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();
        backend
            .write("manifest.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(
            backend.list().await.unwrap(),
            vec!["manifest.json".to_string(), "media/2024/car.jpg".to_string()]
        );
        assert_eq!(
            backend.read("media/2024/car.jpg").await.unwrap(),
            Bytes::from_static(b"jpeg")
        );

        backend.delete("media/2024/car.jpg").await.unwrap();
        assert!(!backend.root().join("media").exists());
        assert!(backend.read("media/2024/car.jpg").await.unwrap_err().is_not_found());

        // Deleting twice is fine
        backend.delete("media/2024/car.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(temp.path().join("b.bk"));

        backend.write("db/app.db", Bytes::from_static(b"one")).await.unwrap();
        backend.write("db/app.db", Bytes::from_static(b"two")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(backend.root().join("db"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["app.db".to_string()]);
        assert_eq!(backend.read("db/app.db").await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_lock_file_is_not_an_entry() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("b.bk");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(DIRECTORY_LOCK_FILE), b"{}").unwrap();

        let backend = DirectoryBackend::new(&root);
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_restores_overwritten_entries() {
        let temp = TempDir::new().unwrap();
        let backend = DirectoryBackend::with_rollback(temp.path().join("b.bk"));
        backend.write("media/car.jpg", Bytes::from_static(b"v1")).await.unwrap();
        backend.finalize().await.unwrap();

        backend.write("media/car.jpg", Bytes::from_static(b"v2")).await.unwrap();
        backend.write("media/2024/kite.jpg", Bytes::from_static(b"kite")).await.unwrap();
        assert_eq!(backend.read("media/car.jpg").await.unwrap(), Bytes::from_static(b"v2"));
        assert!(backend.root().join(ROLLBACK_DIR).exists());
        assert_eq!(backend.list().await.unwrap().len(), 2);

        backend.abort().await.unwrap();
        assert_eq!(backend.read("media/car.jpg").await.unwrap(), Bytes::from_static(b"v1"));
        assert_eq!(backend.list().await.unwrap(), vec!["media/car.jpg".to_string()]);
        assert!(!backend.root().join("media/2024").exists());
        assert!(!backend.root().join(ROLLBACK_DIR).exists());
    }

    #[tokio::test]
    async fn test_finalize_keeps_new_entries() {
        let temp = TempDir::new().unwrap();
        let backend = DirectoryBackend::with_rollback(temp.path().join("b.bk"));
        backend.write("manifest.json", Bytes::from_static(b"1")).await.unwrap();
        backend.finalize().await.unwrap();
        backend.write("manifest.json", Bytes::from_static(b"2")).await.unwrap();
        backend.write("manifest.json", Bytes::from_static(b"3")).await.unwrap();
        backend.finalize().await.unwrap();

        // Nothing left to undo
        backend.abort().await.unwrap();
        assert_eq!(backend.read("manifest.json").await.unwrap(), Bytes::from_static(b"3"));
        assert!(!backend.root().join(ROLLBACK_DIR).exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(temp.path().join("b.bk"));
        let err = backend
            .write("../outside", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuckethError::InvalidEntryPath(_)));
    }
}
