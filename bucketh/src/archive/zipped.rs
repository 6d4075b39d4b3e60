//! `.bkz` buckets: a single zip file.
//!
//! Writes and deletes are staged in memory and only reach disk on
//! `finalize`, which builds a complete new archive next to the old one and
//! renames it over the top. Until then readers of the file on disk see the
//! previous generation untouched.

use super::{validate_entry_path, BucketArchive};
use crate::bucket::BucketKind;
use crate::config::TransferConfig;
use crate::fs::walker::TEMP_PREFIX;
use crate::utils::errors::{BuckethError, Result};
use ::zip::result::ZipError;
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

type SharedArchive = Arc<StdMutex<Option<ZipArchive<File>>>>;

#[derive(Debug, Default)]
struct Pending {
    /// Entry names present in the archive on disk
    existing: BTreeSet<String>,
    staged: BTreeMap<String, Bytes>,
    deleted: BTreeSet<String>,
}

pub struct ZipBackend {
    path: PathBuf,
    options: SimpleFileOptions,
    archive: SharedArchive,
    pending: Mutex<Pending>,
}

impl ZipBackend {
    /// Open `path`, which need not exist yet.
    pub async fn open(path: PathBuf, transfer: &TransferConfig) -> Result<Self> {
        let options = file_options(transfer)?;
        let target = path.clone();
        let (archive, existing) = tokio::task::spawn_blocking(move || open_archive(&target)).await??;

        debug!("Opened zip bucket {} ({} entries)", path.display(), existing.len());
        Ok(Self {
            path,
            options,
            archive: Arc::new(StdMutex::new(archive)),
            pending: Mutex::new(Pending {
                existing,
                ..Default::default()
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn file_options(transfer: &TransferConfig) -> Result<SimpleFileOptions> {
    let method = match transfer.compression.as_str() {
        "stored" => CompressionMethod::Stored,
        "deflated" => CompressionMethod::Deflated,
        "zstd" => CompressionMethod::Zstd,
        other => {
            return Err(BuckethError::Config(format!(
                "Unknown compression method: {}",
                other
            )))
        }
    };
    let mut options = SimpleFileOptions::default().compression_method(method);
    if method != CompressionMethod::Stored {
        options = options.compression_level(transfer.compression_level);
    }
    Ok(options)
}

fn open_archive(path: &Path) -> Result<(Option<ZipArchive<File>>, BTreeSet<String>)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((None, BTreeSet::new())),
        Err(e) => return Err(e.into()),
    };
    let archive = ZipArchive::new(file)?;
    let names = archive
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(str::to_string)
        .collect();
    Ok((Some(archive), names))
}

fn lock_archive(archive: &SharedArchive) -> Result<std::sync::MutexGuard<'_, Option<ZipArchive<File>>>> {
    archive
        .lock()
        .map_err(|_| BuckethError::Io(std::io::Error::other("zip archive lock poisoned")))
}

#[async_trait]
impl BucketArchive for ZipBackend {
    fn kind(&self) -> BucketKind {
        BucketKind::Archive
    }

    async fn list(&self) -> Result<Vec<String>> {
        let pending = self.pending.lock().await;
        let names: BTreeSet<String> = pending
            .existing
            .iter()
            .filter(|name| !pending.deleted.contains(*name))
            .chain(pending.staged.keys())
            .cloned()
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        validate_entry_path(path)?;
        {
            let pending = self.pending.lock().await;
            if let Some(data) = pending.staged.get(path) {
                return Ok(data.clone());
            }
            if pending.deleted.contains(path) || !pending.existing.contains(path) {
                return Err(BuckethError::NotFound(path.to_string()));
            }
        }

        let archive = Arc::clone(&self.archive);
        let name = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut guard = lock_archive(&archive)?;
            let zip = guard
                .as_mut()
                .ok_or_else(|| BuckethError::NotFound(name.clone()))?;
            let mut entry = match zip.by_name(&name) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => return Err(BuckethError::NotFound(name)),
                Err(e) => return Err(e.into()),
            };
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await?
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        validate_entry_path(path)?;
        let mut pending = self.pending.lock().await;
        pending.deleted.remove(path);
        pending.staged.insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_entry_path(path)?;
        let mut pending = self.pending.lock().await;
        pending.staged.remove(path);
        if pending.existing.contains(path) {
            pending.deleted.insert(path.to_string());
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if pending.staged.is_empty() && pending.deleted.is_empty() {
            return Ok(());
        }

        let keep: Vec<String> = pending
            .existing
            .iter()
            .filter(|name| !pending.deleted.contains(*name) && !pending.staged.contains_key(*name))
            .cloned()
            .collect();
        let staged = pending.staged.clone();
        let archive = Arc::clone(&self.archive);
        let path = self.path.clone();
        let options = self.options;

        let names = tokio::task::spawn_blocking(move || -> Result<BTreeSet<String>> {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            std::fs::create_dir_all(&parent)?;

            let temp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(".bkz")
                .tempfile_in(&parent)?;
            let (file, temp_path) = temp.into_parts();

            let mut guard = lock_archive(&archive)?;
            let mut writer = ZipWriter::new(file);

            if let Some(zip) = guard.as_mut() {
                for name in &keep {
                    writer.raw_copy_file(zip.by_name(name)?)?;
                }
            }
            for (name, data) in &staged {
                let entry_options = options.large_file(data.len() as u64 >= u32::MAX as u64);
                writer.start_file(name.as_str(), entry_options)?;
                writer.write_all(data)?;
            }

            let file = writer.finish()?;
            file.sync_all()?;
            drop(file);

            // Release the old archive for the rename, but keep it until the
            // new one is in place.
            let previous = guard.take();
            if let Err(e) = temp_path.persist(&path) {
                *guard = previous;
                return Err(BuckethError::Io(e.error));
            }
            drop(previous);

            let (reopened, names) = open_archive(&path)?;
            *guard = reopened;
            Ok(names)
        })
        .await??;

        info!(
            "Committed zip bucket {} ({} entries, {} written, {} removed)",
            self.path.display(),
            names.len(),
            pending.staged.len(),
            pending.deleted.len()
        );
        pending.existing = names;
        pending.staged.clear();
        pending.deleted.clear();
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if !pending.staged.is_empty() || !pending.deleted.is_empty() {
            debug!(
                "Discarding {} staged and {} deleted entries for {}",
                pending.staged.len(),
                pending.deleted.len(),
                self.path.display()
            );
        }
        pending.staged.clear();
        pending.deleted.clear();
        Ok(())
    }
}
