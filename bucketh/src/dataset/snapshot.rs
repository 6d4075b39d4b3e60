//! Database snapshot providers.
//!
//! A provider produces a consistent byte image of the local database for
//! backup and installs such an image atomically on restore.

use crate::fs::walker::TEMP_PREFIX;
use crate::utils::errors::{BuckethError, Result};
use rusqlite::{Connection, DatabaseName, OpenFlags};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Opens/closes the local relational store for atomic snapshot and install.
pub trait SnapshotProvider: Send + Sync + fmt::Debug {
    /// File name of the snapshot under `db/` in the bucket
    fn snapshot_name(&self) -> String;

    /// Where the live database lives
    fn location(&self) -> &Path;

    /// Consistent image of the database
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the live database with `image`; either fully or not at all
    fn install(&self, image: &[u8]) -> Result<()>;
}

/// SQLite database, snapshotted through the online backup API.
#[derive(Debug, Clone)]
pub struct SqliteSnapshot {
    path: PathBuf,
}

impl SqliteSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotProvider for SqliteSnapshot {
    fn snapshot_name(&self) -> String {
        file_name(&self.path)
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        if !self.path.exists() {
            return Err(BuckethError::NotFound(self.path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let scratch = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        let target = scratch.path().join("snapshot.sqlite");
        conn.backup(DatabaseName::Main, &target, None)?;
        drop(conn);

        let image = fs::read(&target)?;
        debug!("Snapshotted {} ({} bytes)", self.path.display(), image.len());
        Ok(image)
    }

    fn install(&self, image: &[u8]) -> Result<()> {
        let staged = stage(&self.path, image)?;

        {
            let conn = Connection::open(staged.path())?;
            let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            if verdict != "ok" {
                return Err(BuckethError::IntegrityMismatch {
                    path: self.path.display().to_string(),
                    expected: "ok".to_string(),
                    actual: verdict,
                });
            }
        }

        // A leftover journal from the previous database would be replayed
        // against the new file.
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut sidecar = self.path.as_os_str().to_owned();
            sidecar.push(suffix);
            match fs::remove_file(PathBuf::from(sidecar)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        staged
            .persist(&self.path)
            .map_err(|e| BuckethError::Io(e.error))?;
        info!("Installed database {}", self.path.display());
        Ok(())
    }
}

/// Any single-file store copied byte for byte.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotProvider for FileSnapshot {
    fn snapshot_name(&self) -> String {
        file_name(&self.path)
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuckethError::NotFound(self.path.display().to_string())
            } else {
                e.into()
            }
        })
    }

    fn install(&self, image: &[u8]) -> Result<()> {
        stage(&self.path, image)?
            .persist(&self.path)
            .map_err(|e| BuckethError::Io(e.error))?;
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "database".to_string())
}

/// Write `image` to a temp file next to `target` so the final rename is atomic.
fn stage(target: &Path, image: &[u8]) -> Result<tempfile::NamedTempFile> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut staged = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    staged.write_all(image)?;
    staged.as_file().sync_all()?;
    Ok(staged)
}
