//! Backup, restore and verification of buckets.
//!
//! All three operations share an [`EngineContext`]: configuration, the lock
//! registry, the event bus and a cancellation token. Cancellation is
//! cooperative and observed between entries.

pub mod backup;
pub mod manifest;
pub mod restore;
pub mod verify;

use crate::archive::{open_bucket, BucketArchive};
use crate::bucket::{BucketPath, LockRegistry, PathResolver, MANIFEST_PATH};
use crate::config::Config;
use crate::events::{BucketEvent, EventBus, ProgressPayload};
use crate::progress::{format_speed, ProgressTracker};
use crate::utils::errors::{BuckethError, Result};
use manifest::Manifest;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use backup::{BackupEngine, BackupRequest, BackupResult};
pub use manifest::{Entry, EntryKind, ManifestDiff};
pub use restore::{EntryFailure, RestoreEngine, RestoreReport, RestoreResult};
pub use verify::{verify_bucket, VerifyReport};

/// How often progress events are published while an operation runs
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Everything an operation needs besides the dataset and the bucket.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub locks: Arc<LockRegistry>,
    pub events: EventBus,
    pub cancel: CancellationToken,
}

impl EngineContext {
    /// Context using the process-wide lock registry and a fresh event bus.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            locks: LockRegistry::global(),
            events: EventBus::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Resolve a bucket address and map it onto the filesystem.
    pub fn resolve(&self, raw: &str) -> Result<(BucketPath, PathBuf)> {
        let bucket = PathResolver::new(&self.config.cloud).resolve(raw)?;
        let physical = bucket.physical_path(&self.config.cloud)?;
        Ok((bucket, physical))
    }

    fn parallelism(&self) -> usize {
        self.config.transfer.max_parallel_entries.max(1)
    }

    fn stale_after(&self) -> Duration {
        Duration::from_secs(self.config.lock.stale_after_secs)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BuckethError::Cancelled);
        }
        Ok(())
    }
}

/// The manifest stored in a bucket, if there is one.
pub(crate) async fn read_manifest(archive: &dyn BucketArchive) -> Result<Option<Manifest>> {
    match archive.read(MANIFEST_PATH).await {
        Ok(data) => Ok(Some(Manifest::from_json(&data)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Open a bucket read-only and load its validated manifest.
pub async fn inspect_bucket(ctx: &EngineContext, raw: &str) -> Result<(BucketPath, Manifest)> {
    let (bucket, _) = ctx.resolve(raw)?;
    let archive = open_bucket(&bucket, &ctx.config).await?;
    let manifest = read_manifest(archive.as_ref())
        .await?
        .ok_or_else(|| BuckethError::ManifestMissing(bucket.to_string()))?;
    manifest.validate()?;
    Ok((bucket, manifest))
}

/// Completed work, shared between entry tasks and the progress reporter.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    bytes: AtomicU64,
    entries: AtomicUsize,
}

impl Counters {
    pub(crate) fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn entries(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }
}

/// Publish `operation:progress` events until `stop` is cancelled, then one
/// final event. Resolves to the average speed over the whole operation.
pub(crate) fn spawn_progress_reporter(
    events: EventBus,
    operation_id: String,
    total_bytes: u64,
    total_entries: usize,
    counters: Arc<Counters>,
    stop: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new(total_bytes, total_entries);
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);

        loop {
            let stopping = tokio::select! {
                _ = interval.tick() => false,
                _ = stop.cancelled() => true,
            };

            let progress = tracker.update(counters.bytes(), counters.entries());
            events.publish(BucketEvent::Progress(ProgressPayload {
                operation_id: operation_id.clone(),
                percent: progress.percent_complete,
                transferred_bytes: progress.transferred_bytes,
                total_bytes: progress.total_bytes,
                bytes_per_second: progress.bytes_per_second,
                eta_seconds: progress.eta_seconds,
                entries_processed: progress.entries_processed,
                total_entries: progress.total_entries,
                speed: format_speed(progress.bytes_per_second),
            }));

            if stopping {
                break;
            }
        }
        tracker.average_speed()
    })
}
