//! Restore of a bucket into a local dataset.
//!
//! The manifest is read first and nothing is written unless it exists and
//! validates. Every written file is fingerprinted again and compared against
//! the manifest.

use super::manifest::{Entry, EntryKind, Manifest};
use super::{read_manifest, spawn_progress_reporter, Counters, EngineContext};
use crate::archive::{open_bucket, BucketArchive, DirectoryBackend};
use crate::dataset::LocalDataset;
use crate::events::BucketEvent;
use crate::fs::fingerprint::{fingerprint_bytes, fingerprint_file};
use crate::progress::{format_bytes, format_speed};
use crate::utils::errors::{BuckethError, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub generation: u64,
    pub entries_restored: usize,
    pub bytes_restored: u64,
}

/// An entry that could not be restored.
#[derive(Debug)]
pub struct EntryFailure {
    pub path: String,
    pub error: BuckethError,
}

/// What an unsuccessful restore managed to do before it stopped.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub generation: u64,
    pub total_entries: usize,
    pub restored: Vec<String>,
    pub bytes_restored: u64,
    pub failures: Vec<EntryFailure>,
    pub cancelled: bool,
}

impl RestoreReport {
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} of {} entries restored from generation {}, {} failed",
            self.restored.len(),
            self.total_entries,
            self.generation,
            self.failures.len()
        );
        if let Some(first) = self.failures.first() {
            summary.push_str(&format!(" (first: {})", first.error));
        }
        if self.cancelled {
            summary.push_str(", cancelled");
        }
        summary
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty() && self.restored.len() == self.total_entries
    }

    /// Paths whose restored bytes did not match the manifest
    pub fn integrity_failures(&self) -> impl Iterator<Item = &str> {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, BuckethError::IntegrityMismatch { .. }))
            .map(|f| f.path.as_str())
    }

    fn record(&mut self, path: &str, size: u64) {
        self.restored.push(path.to_string());
        self.bytes_restored += size;
    }
}

/// Failures that only affect their own entry; anything else stops the restore.
fn is_entry_failure(error: &BuckethError) -> bool {
    matches!(
        error,
        BuckethError::IntegrityMismatch { .. } | BuckethError::NotFound(_)
    )
}

pub struct RestoreEngine {
    ctx: EngineContext,
}

impl RestoreEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Restore the bucket at `source` into `dataset`.
    pub async fn run(&self, source: &str, dataset: &LocalDataset) -> Result<RestoreResult> {
        let operation_id = Uuid::new_v4().to_string();
        let result = self.execute(&operation_id, source, dataset).await;

        match &result {
            Ok(summary) => self.ctx.events.publish(BucketEvent::RestoreCompleted {
                operation_id,
                generation: summary.generation,
                entries_restored: summary.entries_restored,
                bytes_restored: summary.bytes_restored,
            }),
            Err(e) => {
                error!("Restore from {} failed: {}", source, e);
                self.ctx.events.publish(BucketEvent::Failed {
                    operation_id,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn execute(
        &self,
        operation_id: &str,
        source: &str,
        dataset: &LocalDataset,
    ) -> Result<RestoreResult> {
        let (bucket, _) = self.ctx.resolve(source)?;
        let _dataset_lease = self.ctx.locks.acquire_dataset(&dataset.media_dir)?;

        let archive = open_bucket(&bucket, &self.ctx.config).await?;
        let manifest = read_manifest(archive.as_ref())
            .await?
            .ok_or_else(|| BuckethError::ManifestMissing(bucket.to_string()))?;
        manifest.validate()?;

        let resources = match &dataset.resources_dir {
            Some(dir) => Some(DirectoryBackend::new(dir)),
            None if manifest.count_of(EntryKind::Resource) > 0 => {
                return Err(BuckethError::Config(
                    "bucket contains resources but the dataset has no resources directory"
                        .to_string(),
                ))
            }
            None => None,
        };
        let media = DirectoryBackend::new(&dataset.media_dir);

        let mut report = RestoreReport {
            generation: manifest.generation,
            total_entries: manifest.entries.len(),
            ..Default::default()
        };
        info!(
            "Restoring {} (generation {}, {} entries, {})",
            bucket,
            manifest.generation,
            report.total_entries,
            format_bytes(manifest.total_bytes())
        );
        self.ctx.events.publish(BucketEvent::RestoreStarted {
            operation_id: operation_id.to_string(),
            bucket: bucket.to_string(),
            generation: manifest.generation,
            total_entries: report.total_entries,
            total_bytes: manifest.total_bytes(),
        });

        let counters = Arc::new(Counters::default());
        let stop_progress = self.ctx.cancel.child_token();
        let reporter = spawn_progress_reporter(
            self.ctx.events.clone(),
            operation_id.to_string(),
            manifest.total_bytes(),
            report.total_entries,
            Arc::clone(&counters),
            stop_progress.clone(),
        );

        self.restore_entries(
            archive.as_ref(),
            &manifest,
            dataset,
            &media,
            resources.as_ref(),
            operation_id,
            &counters,
            &mut report,
        )
        .await;
        stop_progress.cancel();
        let average_speed = reporter.await.unwrap_or_default();

        if !report.is_complete() {
            warn!("Restore from {} incomplete: {}", bucket, report.summary());
            return Err(BuckethError::RestoreIncomplete(Box::new(report)));
        }

        info!(
            "Restore complete: {} entries ({} at {}) from {}",
            report.restored.len(),
            format_bytes(report.bytes_restored),
            format_speed(average_speed),
            bucket
        );
        Ok(RestoreResult {
            generation: report.generation,
            entries_restored: report.restored.len(),
            bytes_restored: report.bytes_restored,
        })
    }

    /// Database first, then files with bounded concurrency. Outcomes land in
    /// `report`.
    #[allow(clippy::too_many_arguments)]
    async fn restore_entries(
        &self,
        archive: &dyn BucketArchive,
        manifest: &Manifest,
        dataset: &LocalDataset,
        media: &DirectoryBackend,
        resources: Option<&DirectoryBackend>,
        operation_id: &str,
        counters: &Counters,
        report: &mut RestoreReport,
    ) {
        let (databases, files): (Vec<&Entry>, Vec<&Entry>) = manifest
            .entries
            .values()
            .partition(|e| e.kind == EntryKind::DatabaseSnapshot);

        for entry in databases {
            let outcome = match self.ctx.check_cancelled() {
                Ok(()) => self.install_database(archive, entry, dataset).await,
                Err(e) => Err(e),
            };
            if !self.settle(entry, outcome, operation_id, counters, report) {
                return;
            }
        }

        // Once the restore stops, no new file starts; files already being
        // written are awaited and recorded.
        let halt = CancellationToken::new();
        let halted = &halt;
        let mut outcomes = stream::iter(files)
            .map(move |entry| async move {
                if halted.is_cancelled() {
                    return (entry, None);
                }
                let outcome = self.restore_file(archive, entry, media, resources).await;
                (entry, Some(outcome))
            })
            .buffer_unordered(self.ctx.parallelism());

        while let Some((entry, outcome)) = outcomes.next().await {
            let Some(outcome) = outcome else { continue };
            if !self.settle(entry, outcome, operation_id, counters, report) {
                halt.cancel();
            }
        }
    }

    /// Record one entry's outcome. Returns whether the restore should go on.
    fn settle(
        &self,
        entry: &Entry,
        outcome: Result<u64>,
        operation_id: &str,
        counters: &Counters,
        report: &mut RestoreReport,
    ) -> bool {
        match outcome {
            Ok(size) => {
                counters.record(size);
                report.record(&entry.path, size);
                debug!("Restored {} ({})", entry.path, format_bytes(size));
                self.ctx.events.publish(BucketEvent::EntryRestored {
                    operation_id: operation_id.to_string(),
                    path: entry.path.clone(),
                    size,
                });
                true
            }
            Err(BuckethError::Cancelled) => {
                report.cancelled = true;
                false
            }
            Err(error) => {
                let keep_going = is_entry_failure(&error);
                warn!("Failed to restore {}: {}", entry.path, error);
                self.ctx.events.publish(BucketEvent::EntryFailed {
                    operation_id: operation_id.to_string(),
                    path: entry.path.clone(),
                    error: error.to_string(),
                });
                report.failures.push(EntryFailure {
                    path: entry.path.clone(),
                    error,
                });
                keep_going
            }
        }
    }

    /// Check the image before it replaces the live database, then confirm
    /// what landed on disk.
    async fn install_database(
        &self,
        archive: &dyn BucketArchive,
        entry: &Entry,
        dataset: &LocalDataset,
    ) -> Result<u64> {
        let image = archive.read(&entry.path).await?;
        let actual = fingerprint_bytes(&image);
        if actual != entry.fingerprint {
            return Err(mismatch(entry, actual));
        }

        let provider = Arc::clone(&dataset.database);
        let (actual, size) = tokio::task::spawn_blocking(move || -> Result<(String, u64)> {
            provider.install(&image)?;
            Ok(fingerprint_file(provider.location())?)
        })
        .await??;
        if actual != entry.fingerprint {
            return Err(mismatch(entry, actual));
        }
        Ok(size)
    }

    async fn restore_file(
        &self,
        archive: &dyn BucketArchive,
        entry: &Entry,
        media: &DirectoryBackend,
        resources: Option<&DirectoryBackend>,
    ) -> Result<u64> {
        self.ctx.check_cancelled()?;

        let target = match entry.kind {
            EntryKind::MediaOriginal | EntryKind::MediaVariant => media,
            EntryKind::Resource => resources.ok_or_else(|| {
                BuckethError::Config("no resources directory to restore into".to_string())
            })?,
            EntryKind::DatabaseSnapshot => {
                return Err(BuckethError::InvalidManifest(format!(
                    "{} is not a file entry",
                    entry.path
                )))
            }
        };

        // A bad bucket entry must never replace what the dataset already has.
        let data = archive.read(&entry.path).await?;
        let hashed = data.clone();
        let actual = tokio::task::spawn_blocking(move || fingerprint_bytes(&hashed)).await?;
        if actual != entry.fingerprint {
            return Err(mismatch(entry, actual));
        }

        let written = target.root().join(entry.local_path());
        let existed = tokio::fs::try_exists(&written).await?;
        target.write(entry.local_path(), data).await?;

        let check = written.clone();
        let (actual, size) = tokio::task::spawn_blocking(move || fingerprint_file(&check)).await??;
        if actual != entry.fingerprint {
            if !existed {
                tokio::fs::remove_file(&written).await?;
            }
            return Err(mismatch(entry, actual));
        }
        Ok(size)
    }
}

fn mismatch(entry: &Entry, actual: String) -> BuckethError {
    BuckethError::IntegrityMismatch {
        path: entry.path.clone(),
        expected: entry.fingerprint.clone(),
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ZipBackend;
    use crate::bucket::MANIFEST_PATH;
    use crate::config::TransferConfig;
    use crate::dataset::SqliteSnapshot;
    use crate::executor::test_support::{tree, write, Fixture};
    use crate::executor::BackupEngine;
    use bytes::Bytes;
    use std::fs;

    async fn round_trip(bucket: &str) {
        let fx = Fixture::new();
        let source = fx.dataset("device");
        let target = fx.path(bucket);
        let target = target.to_str().unwrap();

        let backup = BackupEngine::new(fx.ctx.clone())
            .run(&source, target)
            .await
            .unwrap();

        let destination = fx.empty_dataset("restored");
        let result = RestoreEngine::new(fx.ctx.clone())
            .run(target, &destination)
            .await
            .unwrap();

        assert_eq!(result.generation, backup.generation);
        assert_eq!(result.entries_restored, 7);
        assert_eq!(tree(&fx.path("device")), tree(&fx.path("restored")));
    }

    #[tokio::test]
    async fn test_directory_round_trip() {
        round_trip("buckets/photos.bk").await;
    }

    #[tokio::test]
    async fn test_archive_round_trip() {
        round_trip("buckets/photos.bkz").await;
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let fx = Fixture::new();
        let db = fx.path("device/library.sqlite");
        fs::create_dir_all(db.parent().unwrap()).unwrap();
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            conn.execute_batch(
                "CREATE TABLE assets (root TEXT PRIMARY KEY);
                 INSERT INTO assets VALUES ('car');",
            )
            .unwrap();
        }
        write(&fx.path("device/media/car.jpg"), b"car");

        let source = LocalDataset::new(Arc::new(SqliteSnapshot::new(&db)), fx.path("device/media"));
        BackupEngine::new(fx.ctx.clone())
            .run(&source, "icloud://library.bkz")
            .await
            .unwrap();

        let restored_db = fx.path("restored/library.sqlite");
        let destination = LocalDataset::new(
            Arc::new(SqliteSnapshot::new(&restored_db)),
            fx.path("restored/media"),
        );
        RestoreEngine::new(fx.ctx.clone())
            .run("icloud://library.bkz", &destination)
            .await
            .unwrap();

        let conn = rusqlite::Connection::open(&restored_db).unwrap();
        let root: String = conn
            .query_row("SELECT root FROM assets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(root, "car");
        assert_eq!(fs::read(fx.path("restored/media/car.jpg")).unwrap(), b"car");
    }

    #[tokio::test]
    async fn test_missing_manifest_writes_nothing() {
        let fx = Fixture::new();
        let target = fx.path("buckets/empty.bk");
        write(&target.join("media/car.jpg"), b"stray");

        let destination = fx.empty_dataset("restored");
        let err = RestoreEngine::new(fx.ctx.clone())
            .run(target.to_str().unwrap(), &destination)
            .await
            .unwrap_err();

        assert!(matches!(err, BuckethError::ManifestMissing(_)));
        assert!(!fx.path("restored").exists());
    }

    #[tokio::test]
    async fn test_corrupted_entry_fails_alone() {
        let fx = Fixture::new();
        let source = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        BackupEngine::new(fx.ctx.clone())
            .run(&source, target.to_str().unwrap())
            .await
            .unwrap();
        fs::write(target.join("media/car.png"), b"bit rot").unwrap();

        let destination = fx.empty_dataset("restored");
        let err = RestoreEngine::new(fx.ctx.clone())
            .run(target.to_str().unwrap(), &destination)
            .await
            .unwrap_err();

        let report = match err {
            BuckethError::RestoreIncomplete(report) => report,
            other => panic!("Unexpected error: {:?}", other),
        };
        assert_eq!(report.integrity_failures().collect::<Vec<_>>(), vec!["media/car.png"]);
        assert_eq!(report.restored.len(), 6);
        assert!(!report.cancelled);
        assert!(!fx.path("restored/media/car.png").exists());
        assert_eq!(
            fs::read(fx.path("restored/media/car.jpg")).unwrap(),
            b"car original"
        );
    }

    #[tokio::test]
    async fn test_corrupted_entry_keeps_existing_local_file() {
        let fx = Fixture::new();
        let source = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        BackupEngine::new(fx.ctx.clone())
            .run(&source, target.to_str().unwrap())
            .await
            .unwrap();
        fs::write(target.join("media/car.png"), b"bit rot").unwrap();

        // The destination already holds a good copy of every file.
        let destination = fx.dataset("restored");
        let err = RestoreEngine::new(fx.ctx.clone())
            .run(target.to_str().unwrap(), &destination)
            .await
            .unwrap_err();

        match err {
            BuckethError::RestoreIncomplete(report) => {
                assert_eq!(report.integrity_failures().collect::<Vec<_>>(), vec!["media/car.png"]);
            }
            other => panic!("Unexpected error: {:?}", other),
        }
        assert_eq!(
            fs::read(fx.path("restored/media/car.png")).unwrap(),
            b"car png rendition"
        );
        assert_eq!(tree(&fx.path("device")), tree(&fx.path("restored")));
    }

    #[tokio::test]
    async fn test_corrupted_archive_entry_fails_alone() {
        let fx = Fixture::new();
        let source = fx.dataset("device");
        let target = fx.path("buckets/photos.bkz");
        BackupEngine::new(fx.ctx.clone())
            .run(&source, target.to_str().unwrap())
            .await
            .unwrap();

        let archive = ZipBackend::open(target.clone(), &TransferConfig::default())
            .await
            .unwrap();
        archive
            .write("media/2024/boat.small.jpg", Bytes::from_static(b"tampered"))
            .await
            .unwrap();
        archive.finalize().await.unwrap();
        drop(archive);

        let destination = fx.empty_dataset("restored");
        let err = RestoreEngine::new(fx.ctx.clone())
            .run(target.to_str().unwrap(), &destination)
            .await
            .unwrap_err();
        match err {
            BuckethError::RestoreIncomplete(report) => {
                assert_eq!(
                    report.integrity_failures().collect::<Vec<_>>(),
                    vec!["media/2024/boat.small.jpg"]
                );
                assert_eq!(report.restored.len(), 6);
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupted_database_is_not_installed() {
        let fx = Fixture::new();
        let source = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        BackupEngine::new(fx.ctx.clone())
            .run(&source, target.to_str().unwrap())
            .await
            .unwrap();
        fs::write(target.join("db/app.db"), b"garbage").unwrap();

        let destination = fx.empty_dataset("restored");
        let err = RestoreEngine::new(fx.ctx.clone())
            .run(target.to_str().unwrap(), &destination)
            .await
            .unwrap_err();
        assert!(matches!(err, BuckethError::RestoreIncomplete(_)));
        assert!(!fx.path("restored/app.db").exists());
        assert!(fx.path("restored/media/car.jpg").exists());
    }

    #[tokio::test]
    async fn test_cancelled_restore_is_incomplete() {
        let fx = Fixture::new();
        let source = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        BackupEngine::new(fx.ctx.clone())
            .run(&source, target.to_str().unwrap())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = RestoreEngine::new(fx.ctx.clone().with_cancel(cancel))
            .run(target.to_str().unwrap(), &fx.empty_dataset("restored"))
            .await
            .unwrap_err();
        match err {
            BuckethError::RestoreIncomplete(report) => {
                assert!(report.cancelled);
                assert!(report.restored.is_empty());
                assert!(report.summary().contains("cancelled"));
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_rejected_before_writes() {
        let fx = Fixture::new();
        let target = fx.path("buckets/broken.bk");
        write(&target.join(MANIFEST_PATH), b"{\"format\": 1}");

        let err = RestoreEngine::new(fx.ctx.clone())
            .run(target.to_str().unwrap(), &fx.empty_dataset("restored"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuckethError::InvalidManifest(_)));
        assert!(!fx.path("restored").exists());
    }
}
