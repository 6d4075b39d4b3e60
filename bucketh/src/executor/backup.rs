//! Incremental backup of a local dataset into a bucket.
//!
//! Only entries whose fingerprint differs from the bucket's current manifest
//! are written. The new manifest is written strictly after every data entry,
//! so a failed or cancelled backup leaves the bucket at its previous
//! generation.

use super::manifest::{LocalState, Manifest};
use super::{read_manifest, spawn_progress_reporter, Counters, EngineContext};
use crate::archive::{open_bucket, BucketArchive};
use crate::bucket::MANIFEST_PATH;
use crate::dataset::LocalDataset;
use crate::events::BucketEvent;
use crate::fs::fingerprint::fingerprint_bytes;
use crate::progress::{format_bytes, format_speed};
use crate::utils::errors::{BuckethError, Result};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A backup target plus optional concurrent-writer detection.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub target: String,
    /// Fail with `StaleGeneration` unless the bucket is still at this generation
    pub expected_generation: Option<u64>,
}

impl BackupRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            expected_generation: None,
        }
    }

    pub fn expect_generation(mut self, generation: u64) -> Self {
        self.expected_generation = Some(generation);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    pub generation: u64,
    pub bytes_written: u64,
    pub entries_written: usize,
    pub entries_removed: usize,
    pub entries_unchanged: usize,
    /// Media files left out because no original claims them
    #[serde(default)]
    pub skipped: Vec<String>,
}

pub struct BackupEngine {
    ctx: EngineContext,
}

impl BackupEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Back `dataset` up into the bucket at `target`.
    pub async fn run(&self, dataset: &LocalDataset, target: &str) -> Result<BackupResult> {
        self.run_request(dataset, &BackupRequest::new(target)).await
    }

    pub async fn run_request(
        &self,
        dataset: &LocalDataset,
        request: &BackupRequest,
    ) -> Result<BackupResult> {
        let operation_id = Uuid::new_v4().to_string();
        let result = self.execute(&operation_id, dataset, request).await;

        match &result {
            Ok(summary) => self.ctx.events.publish(BucketEvent::BackupCompleted {
                operation_id,
                result: summary.clone(),
            }),
            Err(e) => {
                error!("Backup to {} failed: {}", request.target, e);
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
        dataset: &LocalDataset,
        request: &BackupRequest,
    ) -> Result<BackupResult> {
        let (bucket, physical) = self.ctx.resolve(&request.target)?;
        let _bucket_lease = self
            .ctx
            .locks
            .acquire_bucket(&bucket, &physical, self.ctx.stale_after())?;
        let _dataset_lease = self.ctx.locks.acquire_dataset(&dataset.media_dir)?;

        let archive = open_bucket(&bucket, &self.ctx.config).await?;
        let previous = match read_manifest(archive.as_ref()).await? {
            Some(manifest) => {
                manifest.validate()?;
                manifest
            }
            None => Manifest::empty(),
        };

        if let Some(expected) = request.expected_generation {
            if expected != previous.generation {
                return Err(BuckethError::StaleGeneration {
                    expected,
                    found: previous.generation,
                });
            }
        }
        self.ctx.check_cancelled()?;

        let snapshot = dataset.clone();
        let mut local = tokio::task::spawn_blocking(move || Manifest::build(&snapshot)).await??;
        local.manifest.generation = previous.generation + 1;
        local.manifest.created_at = Utc::now();

        let diff = Manifest::diff(&previous, &local.manifest);
        let to_write: Vec<String> = diff.to_write().cloned().collect();
        let bytes_to_write: u64 = to_write
            .iter()
            .filter_map(|path| local.manifest.get(path))
            .map(|e| e.size)
            .sum();

        info!(
            "Backing up to {} (generation {} -> {}): {} added, {} changed, {} removed, {} to write",
            bucket,
            previous.generation,
            local.manifest.generation,
            diff.added.len(),
            diff.changed.len(),
            diff.removed.len(),
            format_bytes(bytes_to_write)
        );
        self.ctx.events.publish(BucketEvent::BackupStarted {
            operation_id: operation_id.to_string(),
            bucket: bucket.to_string(),
            generation: local.manifest.generation,
            entries_to_write: to_write.len(),
            bytes_to_write,
        });

        let counters = Arc::new(Counters::default());
        let stop_progress = self.ctx.cancel.child_token();
        let reporter = spawn_progress_reporter(
            self.ctx.events.clone(),
            operation_id.to_string(),
            bytes_to_write,
            to_write.len(),
            Arc::clone(&counters),
            stop_progress.clone(),
        );

        let committed = self
            .write_generation(archive.as_ref(), &local, to_write, operation_id, &counters)
            .await;
        stop_progress.cancel();
        let average_speed = reporter.await.unwrap_or_default();
        if let Err(e) = committed {
            if let Err(rollback) = archive.abort().await {
                error!("Failed to roll back {}: {}", bucket, rollback);
            }
            return Err(e);
        }

        for path in &diff.removed {
            if let Err(e) = archive.delete(path).await {
                warn!("Failed to remove {} from {}: {}", path, bucket, e);
            }
        }
        archive.finalize().await?;

        let result = BackupResult {
            generation: local.manifest.generation,
            bytes_written: counters.bytes(),
            entries_written: counters.entries(),
            entries_removed: diff.removed.len(),
            entries_unchanged: local.manifest.entries.len() - diff.added.len() - diff.changed.len(),
            skipped: local.skipped,
        };
        info!(
            "Backup complete: {} at generation {} ({} entries, {} written at {}, {} unchanged, {} removed)",
            bucket,
            result.generation,
            local.manifest.entries.len(),
            format_bytes(result.bytes_written),
            format_speed(average_speed),
            result.entries_unchanged,
            result.entries_removed
        );
        Ok(result)
    }

    /// Data entries, then the manifest. Any error leaves the new generation
    /// uncommitted.
    async fn write_generation(
        &self,
        archive: &dyn BucketArchive,
        local: &LocalState,
        paths: Vec<String>,
        operation_id: &str,
        counters: &Counters,
    ) -> Result<()> {
        self.write_entries(archive, local, paths, operation_id, counters).await?;

        // Last chance to back out before the bucket advances.
        self.ctx.check_cancelled()?;
        archive
            .write(MANIFEST_PATH, Bytes::from(local.manifest.to_json()?))
            .await
    }

    /// Bounded concurrent writes. After the first failure no new write starts,
    /// and every write already running is awaited before returning.
    async fn write_entries(
        &self,
        archive: &dyn BucketArchive,
        local: &LocalState,
        paths: Vec<String>,
        operation_id: &str,
        counters: &Counters,
    ) -> Result<()> {
        let halt = self.ctx.cancel.child_token();
        let halted = &halt;
        let mut writes = stream::iter(paths)
            .map(move |path: String| async move {
                if halted.is_cancelled() {
                    return Err(BuckethError::Cancelled);
                }
                self.write_entry(archive, local, &path, operation_id, counters)
                    .await
                    .map_err(|e| match e {
                        BuckethError::Cancelled => e,
                        other => BuckethError::PartialWriteAborted {
                            path,
                            source: Box::new(other),
                        },
                    })
            })
            .buffer_unordered(self.ctx.parallelism());

        let mut first_error = None;
        while let Some(outcome) = writes.next().await {
            if let Err(e) = outcome {
                halt.cancel();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn write_entry(
        &self,
        archive: &dyn BucketArchive,
        local: &LocalState,
        path: &str,
        operation_id: &str,
        counters: &Counters,
    ) -> Result<()> {
        self.ctx.check_cancelled()?;

        let entry = local
            .manifest
            .get(path)
            .ok_or_else(|| BuckethError::InvalidManifest(format!("no entry for {}", path)))?;
        let source = local
            .sources
            .get(path)
            .ok_or_else(|| BuckethError::NotFound(path.to_string()))?;

        let data = source.load().await?;
        let hashed = data.clone();
        let actual = tokio::task::spawn_blocking(move || fingerprint_bytes(&hashed)).await?;
        if actual != entry.fingerprint {
            // Changed on disk since the manifest was built
            return Err(BuckethError::IntegrityMismatch {
                path: path.to_string(),
                expected: entry.fingerprint.clone(),
                actual,
            });
        }

        let size = data.len() as u64;
        archive.write(path, data).await?;
        counters.record(size);

        debug!("Wrote {} ({})", path, format_bytes(size));
        self.ctx.events.publish(BucketEvent::EntryWritten {
            operation_id: operation_id.to_string(),
            path: path.to_string(),
            size,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{DirectoryBackend, ZipBackend, ROLLBACK_DIR};
    use crate::config::TransferConfig;
    use crate::dataset::SqliteSnapshot;
    use crate::executor::test_support::{tree, write, Fixture};
    use crate::executor::verify_bucket;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_first_backup_writes_everything() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");

        let result = BackupEngine::new(fx.ctx.clone())
            .run(&dataset, target.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(result.generation, 1);
        assert_eq!(result.entries_written, 7);
        assert_eq!(result.entries_unchanged, 0);
        assert!(target.join("manifest.json").exists());
        assert!(target.join("db/app.db").exists());
        assert!(target.join("media/car.thumb.jpg").exists());
        assert!(target.join("media/2024/boat.small.jpg").exists());
        assert!(target.join("resources/theme.json").exists());
        assert!(!target.join(".bucketh.lock").exists());
    }

    #[tokio::test]
    async fn test_second_backup_without_changes_writes_no_data() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bkz");
        let engine = BackupEngine::new(fx.ctx.clone());

        let first = engine.run(&dataset, target.to_str().unwrap()).await.unwrap();
        let second = engine.run(&dataset, target.to_str().unwrap()).await.unwrap();

        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(second.entries_written, 0);
        assert_eq!(second.bytes_written, 0);
        assert_eq!(second.entries_unchanged, 7);

        let archive = ZipBackend::open(target, &TransferConfig::default()).await.unwrap();
        let manifest = read_manifest(&archive).await.unwrap().unwrap();
        assert_eq!(manifest.generation, 2);
        assert!(Manifest::diff(&manifest, &manifest).is_empty());
    }

    #[tokio::test]
    async fn test_incremental_backup_writes_and_removes() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        let engine = BackupEngine::new(fx.ctx.clone());
        engine.run(&dataset, target.to_str().unwrap()).await.unwrap();

        write(&fx.path("device/media/car.thumb.jpg"), b"new thumbnail");
        std::fs::remove_file(fx.path("device/media/car.png")).unwrap();
        write(&fx.path("device/media/kite.jpg"), b"kite");

        let result = engine.run(&dataset, target.to_str().unwrap()).await.unwrap();
        assert_eq!(result.generation, 2);
        assert_eq!(result.entries_written, 2);
        assert_eq!(result.entries_removed, 1);
        assert!(!target.join("media/car.png").exists());
        assert_eq!(
            std::fs::read(target.join("media/car.thumb.jpg")).unwrap(),
            b"new thumbnail"
        );
    }

    #[tokio::test]
    async fn test_expected_generation_detects_other_writer() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        let engine = BackupEngine::new(fx.ctx.clone());
        engine.run(&dataset, target.to_str().unwrap()).await.unwrap();

        let request = BackupRequest::new(target.to_str().unwrap()).expect_generation(0);
        let err = engine.run_request(&dataset, &request).await.unwrap_err();
        assert!(matches!(
            err,
            BuckethError::StaleGeneration { expected: 0, found: 1 }
        ));

        let request = BackupRequest::new(target.to_str().unwrap()).expect_generation(1);
        assert_eq!(engine.run_request(&dataset, &request).await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_locked_bucket_is_contended() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let (bucket, physical) = fx.ctx.resolve("icloud://photos.bk").unwrap();
        let _held = fx
            .ctx
            .locks
            .acquire_bucket(&bucket, &physical, fx.ctx.stale_after())
            .unwrap();

        let err = BackupEngine::new(fx.ctx.clone())
            .run(&dataset, "icloud://photos.bk")
            .await
            .unwrap_err();
        assert!(matches!(err, BuckethError::LockContention(_)));
        assert!(!physical.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn test_cancelled_backup_leaves_previous_generation() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bkz");
        BackupEngine::new(fx.ctx.clone())
            .run(&dataset, target.to_str().unwrap())
            .await
            .unwrap();
        let before = std::fs::read(&target).unwrap();

        write(&fx.path("device/media/kite.jpg"), b"kite");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = BackupEngine::new(fx.ctx.clone().with_cancel(cancel))
            .run(&dataset, target.to_str().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, BuckethError::Cancelled));
        assert_eq!(std::fs::read(&target).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_advance_generation() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        let engine = BackupEngine::new(fx.ctx.clone());
        engine.run(&dataset, target.to_str().unwrap()).await.unwrap();

        // A directory squatting on an entry path makes that write fail.
        write(&fx.path("device/media/kite.jpg"), b"kite");
        std::fs::create_dir_all(target.join("media/kite.jpg/blocker")).unwrap();

        let err = engine.run(&dataset, target.to_str().unwrap()).await.unwrap_err();
        match err {
            BuckethError::PartialWriteAborted { path, .. } => assert_eq!(path, "media/kite.jpg"),
            other => panic!("Unexpected error: {:?}", other),
        }

        let manifest = read_manifest(&DirectoryBackend::new(&target))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifest.generation, 1);
        assert!(manifest.get("media/kite.jpg").is_none());
    }

    #[tokio::test]
    async fn test_failed_backup_restores_overwritten_entries() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        let engine = BackupEngine::new(fx.ctx.clone());
        engine.run(&dataset, target.to_str().unwrap()).await.unwrap();

        // One changed entry that can be written, one new entry that cannot.
        write(&fx.path("device/media/car.thumb.jpg"), b"new thumbnail");
        write(&fx.path("device/media/kite.jpg"), b"kite");
        std::fs::create_dir_all(target.join("media/kite.jpg/blocker")).unwrap();

        let err = engine.run(&dataset, target.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, BuckethError::PartialWriteAborted { .. }));

        let report = verify_bucket(&fx.ctx, target.to_str().unwrap()).await.unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert_eq!(report.generation, 1);
        assert!(report.unreferenced.is_empty());
        assert_eq!(
            std::fs::read(target.join("media/car.thumb.jpg")).unwrap(),
            b"car thumbnail"
        );
        assert!(!target.join(ROLLBACK_DIR).exists());
    }

    #[tokio::test]
    async fn test_cancelled_directory_backup_leaves_previous_generation() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        BackupEngine::new(fx.ctx.clone())
            .run(&dataset, target.to_str().unwrap())
            .await
            .unwrap();
        let before = tree(&target);

        write(&fx.path("device/media/car.png"), b"edited png");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = BackupEngine::new(fx.ctx.clone().with_cancel(cancel))
            .run(&dataset, target.to_str().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, BuckethError::Cancelled));
        assert_eq!(tree(&target), before);
    }

    #[tokio::test]
    async fn test_unchanged_sqlite_dataset_writes_no_data() {
        let fx = Fixture::new();
        let db = fx.path("device/library.sqlite");
        std::fs::create_dir_all(db.parent().unwrap()).unwrap();
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE assets (root TEXT PRIMARY KEY);
                 INSERT INTO assets VALUES ('car'), ('boat');",
            )
            .unwrap();
        }
        write(&fx.path("device/media/car.jpg"), b"car");
        let dataset = LocalDataset::new(Arc::new(SqliteSnapshot::new(&db)), fx.path("device/media"));

        let engine = BackupEngine::new(fx.ctx.clone());
        let first = engine.run(&dataset, "icloud://library.bk").await.unwrap();
        let second = engine.run(&dataset, "icloud://library.bk").await.unwrap();

        assert_eq!(first.entries_written, 2);
        assert_eq!(second.generation, 2);
        assert_eq!(second.entries_written, 0);
        assert_eq!(second.entries_unchanged, 2);
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_before_any_write() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let err = BackupEngine::new(fx.ctx.clone())
            .run(&dataset, "dropbox://photos.bk")
            .await
            .unwrap_err();
        assert!(matches!(err, BuckethError::UnsupportedScheme(_)));
    }
}
