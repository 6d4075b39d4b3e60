//! In-place verification of a bucket against its own manifest.

use super::{read_manifest, EngineContext};
use crate::archive::open_bucket;
use crate::bucket::MANIFEST_PATH;
use crate::fs::fingerprint::fingerprint_bytes;
use crate::utils::errors::{BuckethError, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub generation: u64,
    pub ok: Vec<String>,
    /// Present, but the bytes do not match the recorded fingerprint
    pub mismatched: Vec<String>,
    /// Listed in the manifest, absent from the bucket
    pub missing: Vec<String>,
    /// Stored in the bucket, unknown to the manifest
    pub unreferenced: Vec<String>,
}

impl VerifyReport {
    /// Every manifest entry is present and intact.
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

enum Verdict {
    Ok,
    Mismatched,
    Missing,
}

/// Re-fingerprint every entry of the bucket at `raw`. No local dataset is
/// involved.
pub async fn verify_bucket(ctx: &EngineContext, raw: &str) -> Result<VerifyReport> {
    let (bucket, _) = ctx.resolve(raw)?;
    let archive = open_bucket(&bucket, &ctx.config).await?;
    let archive = archive.as_ref();
    let manifest = read_manifest(archive)
        .await?
        .ok_or_else(|| BuckethError::ManifestMissing(bucket.to_string()))?;
    manifest.validate()?;

    let mut report = VerifyReport {
        generation: manifest.generation,
        ..Default::default()
    };

    let mut verdicts = stream::iter(manifest.entries.values())
        .map(|entry| async move {
            ctx.check_cancelled()?;
            let verdict = match archive.read(&entry.path).await {
                Ok(data) => {
                    let actual =
                        tokio::task::spawn_blocking(move || fingerprint_bytes(&data)).await?;
                    if actual == entry.fingerprint {
                        Verdict::Ok
                    } else {
                        Verdict::Mismatched
                    }
                }
                Err(e) if e.is_not_found() => Verdict::Missing,
                Err(e) => return Err(e),
            };
            Ok::<_, BuckethError>((entry.path.clone(), verdict))
        })
        .buffer_unordered(ctx.parallelism());

    while let Some(outcome) = verdicts.next().await {
        let (path, verdict) = outcome?;
        match verdict {
            Verdict::Ok => report.ok.push(path),
            Verdict::Mismatched => {
                warn!("Fingerprint mismatch: {}", path);
                report.mismatched.push(path)
            }
            Verdict::Missing => {
                warn!("Missing entry: {}", path);
                report.missing.push(path)
            }
        }
    }

    let known: BTreeSet<&str> = manifest.entries.keys().map(String::as_str).collect();
    report.unreferenced = archive
        .list()
        .await?
        .into_iter()
        .filter(|path| path != MANIFEST_PATH && !known.contains(path.as_str()))
        .collect();

    report.ok.sort();
    report.mismatched.sort();
    report.missing.sort();

    info!(
        "Verified {} at generation {}: {} ok, {} mismatched, {} missing, {} unreferenced",
        bucket,
        report.generation,
        report.ok.len(),
        report.mismatched.len(),
        report.missing.len(),
        report.unreferenced.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{write, Fixture};
    use crate::executor::BackupEngine;
    use std::fs;

    #[tokio::test]
    async fn test_clean_bucket_verifies() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        BackupEngine::new(fx.ctx.clone())
            .run(&dataset, "icloud://photos.bkz")
            .await
            .unwrap();

        let report = verify_bucket(&fx.ctx, "icloud://photos.bkz").await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.generation, 1);
        assert_eq!(report.ok.len(), 7);
        assert!(report.unreferenced.is_empty());
    }

    #[tokio::test]
    async fn test_damaged_bucket_is_reported() {
        let fx = Fixture::new();
        let dataset = fx.dataset("device");
        let target = fx.path("buckets/photos.bk");
        BackupEngine::new(fx.ctx.clone())
            .run(&dataset, target.to_str().unwrap())
            .await
            .unwrap();

        fs::write(target.join("media/car.jpg"), b"flipped bits").unwrap();
        fs::remove_file(target.join("resources/theme.json")).unwrap();
        write(&target.join("media/stray.jpg"), b"stray");

        let report = verify_bucket(&fx.ctx, target.to_str().unwrap()).await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.mismatched, vec!["media/car.jpg".to_string()]);
        assert_eq!(report.missing, vec!["resources/theme.json".to_string()]);
        assert_eq!(report.unreferenced, vec!["media/stray.jpg".to_string()]);
        assert_eq!(report.ok.len(), 5);
    }

    #[tokio::test]
    async fn test_verify_without_manifest() {
        let fx = Fixture::new();
        let err = verify_bucket(&fx.ctx, fx.path("nothing.bk").to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BuckethError::ManifestMissing(_)));
    }
}
