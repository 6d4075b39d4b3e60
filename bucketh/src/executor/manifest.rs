//! Bucket manifest: the catalogue of every entry with its fingerprint.
//!
//! Serialized as `manifest.json` at the bucket root. Diffing two manifests
//! by fingerprint is what keeps backups incremental; mtimes are never
//! consulted.

use crate::bucket::{DB_PREFIX, MEDIA_PREFIX, RESOURCES_PREFIX};
use crate::dataset::LocalDataset;
use crate::fs::fingerprint::{fingerprint_bytes, fingerprint_file};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::media::{self, MediaFile};
use crate::utils::errors::{BuckethError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Highest manifest format this build reads and the one it writes
pub const MANIFEST_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    DatabaseSnapshot,
    MediaOriginal,
    MediaVariant,
    Resource,
}

impl EntryKind {
    /// Bucket directory entries of this kind live under
    pub fn prefix(self) -> &'static str {
        match self {
            EntryKind::DatabaseSnapshot => DB_PREFIX,
            EntryKind::MediaOriginal | EntryKind::MediaVariant => MEDIA_PREFIX,
            EntryKind::Resource => RESOURCES_PREFIX,
        }
    }
}

/// One file in the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    /// Bucket-relative path, e.g. `media/2024/car.thumb.jpg`
    pub path: String,
    pub fingerprint: String,
    pub size: u64,
    /// Media root name, set for originals and variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_tag: Option<String>,
}

impl Entry {
    /// Path below the kind's prefix, i.e. relative to the local directory
    /// the entry restores into.
    pub fn local_path(&self) -> &str {
        self.path
            .strip_prefix(self.kind.prefix())
            .unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: u32,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub entries: BTreeMap<String, Entry>,
}

/// Where the bytes of a freshly built entry come from.
#[derive(Debug, Clone)]
pub enum EntrySource {
    File(PathBuf),
    Memory(Bytes),
}

impl EntrySource {
    pub async fn load(&self) -> Result<Bytes> {
        match self {
            EntrySource::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            EntrySource::Memory(data) => Ok(data.clone()),
        }
    }
}

/// A manifest built from the local dataset, plus how to read each entry.
#[derive(Debug)]
pub struct LocalState {
    pub manifest: Manifest,
    pub sources: BTreeMap<String, EntrySource>,
    /// Media files no original claims
    pub skipped: Vec<String>,
}

/// Partition of entry paths between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Entries whose bytes have to be written
    pub fn to_write(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.changed.iter())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

impl Manifest {
    /// Generation 0: what a bucket without a manifest is treated as.
    pub fn empty() -> Self {
        Self {
            format: MANIFEST_FORMAT,
            generation: 0,
            created_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    /// Catalogue the local dataset, fingerprinting every entry.
    ///
    /// Blocking: snapshots the database and hashes every media file. The
    /// returned manifest is at generation 0; the backup assigns the real one.
    pub fn build(dataset: &LocalDataset) -> Result<LocalState> {
        let mut manifest = Manifest::empty();
        let mut sources = BTreeMap::new();

        let image = Bytes::from(dataset.database.snapshot()?);
        let db_path = format!("{}{}", DB_PREFIX, dataset.database.snapshot_name());
        manifest.insert(Entry {
            kind: EntryKind::DatabaseSnapshot,
            path: db_path.clone(),
            fingerprint: fingerprint_bytes(&image),
            size: image.len() as u64,
            root: None,
            variant_tag: None,
        })?;
        sources.insert(db_path, EntrySource::Memory(image));

        let index = media::index(&dataset.media_dir, &dataset.marks)?;
        for asset in index.assets.values() {
            let (path, entry) = media_entry(&asset.original, EntryKind::MediaOriginal, &asset.root, None)?;
            manifest.insert(entry)?;
            sources.insert(path.clone(), EntrySource::File(asset.original.path.clone()));

            for variant in &asset.variants {
                let (path, entry) = media_entry(
                    &variant.file,
                    EntryKind::MediaVariant,
                    &asset.root,
                    Some(variant.tag.clone()),
                )?;
                manifest.insert(entry)?;
                sources.insert(path, EntrySource::File(variant.file.path.clone()));
            }
        }

        let skipped: Vec<String> = index
            .unclaimed
            .iter()
            .map(|f| f.relative_path.clone())
            .collect();
        for path in &skipped {
            warn!("Skipping media file with no original: {}", path);
        }

        if let Some(resources_dir) = &dataset.resources_dir {
            for file in walk_directory(resources_dir, &WalkOptions::default())? {
                let (fingerprint, size) = fingerprint_file(&file.path)?;
                let path = format!("{}{}", RESOURCES_PREFIX, file.relative_path);
                manifest.insert(Entry {
                    kind: EntryKind::Resource,
                    path: path.clone(),
                    fingerprint,
                    size,
                    root: None,
                    variant_tag: None,
                })?;
                sources.insert(path, EntrySource::File(file.path));
            }
        }

        debug!(
            "Built manifest: {} entries, {} bytes",
            manifest.entries.len(),
            manifest.total_bytes()
        );
        Ok(LocalState {
            manifest,
            sources,
            skipped,
        })
    }

    fn insert(&mut self, entry: Entry) -> Result<()> {
        if self.entries.contains_key(&entry.path) {
            return Err(BuckethError::InvalidManifest(format!(
                "duplicate entry path: {}",
                entry.path
            )));
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    pub fn count_of(&self, kind: EntryKind) -> usize {
        self.entries.values().filter(|e| e.kind == kind).count()
    }

    /// Entries in `new` that `old` lacks or holds with different bytes, and
    /// entries only `old` has.
    pub fn diff(old: &Manifest, new: &Manifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();

        for (path, entry) in &new.entries {
            match old.entries.get(path) {
                None => diff.added.push(path.clone()),
                Some(previous) if previous.fingerprint != entry.fingerprint => {
                    diff.changed.push(path.clone())
                }
                Some(_) => {}
            }
        }
        diff.removed = old
            .entries
            .keys()
            .filter(|path| !new.entries.contains_key(*path))
            .cloned()
            .collect();

        diff
    }

    /// Check the structural invariants a restore relies on.
    pub fn validate(&self) -> Result<()> {
        if self.format > MANIFEST_FORMAT {
            return Err(BuckethError::InvalidManifest(format!(
                "unsupported format version {}",
                self.format
            )));
        }

        let mut originals = BTreeSet::new();
        for (key, entry) in &self.entries {
            if key != &entry.path {
                return Err(BuckethError::InvalidManifest(format!(
                    "key {} does not match entry path {}",
                    key, entry.path
                )));
            }
            crate::archive::validate_entry_path(&entry.path)?;
            if !entry.path.starts_with(entry.kind.prefix()) {
                return Err(BuckethError::InvalidManifest(format!(
                    "{} is not under {}",
                    entry.path,
                    entry.kind.prefix()
                )));
            }
            if entry.fingerprint.len() != 64
                || !entry
                    .fingerprint
                    .bytes()
                    .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
            {
                return Err(BuckethError::InvalidManifest(format!(
                    "malformed fingerprint for {}",
                    entry.path
                )));
            }
            if entry.kind == EntryKind::MediaOriginal {
                let root = entry.root.as_ref().ok_or_else(|| {
                    BuckethError::InvalidManifest(format!("original {} has no root", entry.path))
                })?;
                originals.insert(root.as_str());
            }
        }

        if self.count_of(EntryKind::DatabaseSnapshot) > 1 {
            return Err(BuckethError::InvalidManifest(
                "more than one database snapshot".to_string(),
            ));
        }

        for entry in self.entries.values() {
            if entry.kind != EntryKind::MediaVariant {
                continue;
            }
            match entry.root.as_deref() {
                Some(root) if originals.contains(root) => {}
                Some(root) => {
                    return Err(BuckethError::InvalidManifest(format!(
                        "variant {} references missing original '{}'",
                        entry.path, root
                    )))
                }
                None => {
                    return Err(BuckethError::InvalidManifest(format!(
                        "variant {} has no root",
                        entry.path
                    )))
                }
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| BuckethError::InvalidManifest(e.to_string()))
    }
}

fn media_entry(
    file: &MediaFile,
    kind: EntryKind,
    root: &str,
    variant_tag: Option<String>,
) -> Result<(String, Entry)> {
    let (fingerprint, size) = fingerprint_file(&file.path)?;
    let path = format!("{}{}", MEDIA_PREFIX, file.relative_path);
    Ok((
        path.clone(),
        Entry {
            kind,
            path,
            fingerprint,
            size,
            root: Some(root.to_string()),
            variant_tag,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::FileSnapshot;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(kind: EntryKind, path: &str, fill: char) -> Entry {
        Entry {
            kind,
            path: path.to_string(),
            fingerprint: fill.to_string().repeat(64),
            size: 1,
            root: None,
            variant_tag: None,
        }
    }

    fn manifest_of(entries: Vec<Entry>) -> Manifest {
        let mut manifest = Manifest::empty();
        for e in entries {
            manifest.insert(e).unwrap();
        }
        manifest
    }

    #[test]
    fn test_diff_partitions_by_fingerprint() {
        let old = manifest_of(vec![
            entry(EntryKind::Resource, "resources/a", 'a'),
            entry(EntryKind::Resource, "resources/b", 'b'),
            entry(EntryKind::Resource, "resources/c", 'c'),
        ]);
        let mut touched = entry(EntryKind::Resource, "resources/a", 'a');
        touched.size = 999;
        let new = manifest_of(vec![
            touched,
            entry(EntryKind::Resource, "resources/b", 'f'),
            entry(EntryKind::Resource, "resources/d", 'd'),
        ]);

        let diff = Manifest::diff(&old, &new);
        assert_eq!(diff.added, vec!["resources/d".to_string()]);
        assert_eq!(diff.changed, vec!["resources/b".to_string()]);
        assert_eq!(diff.removed, vec!["resources/c".to_string()]);
        assert!(Manifest::diff(&new, &new).is_empty());
    }

    #[test]
    fn test_validate_requires_original_for_variant() {
        let mut variant = entry(EntryKind::MediaVariant, "media/car.png", 'b');
        variant.root = Some("car".to_string());
        variant.variant_tag = Some("png".to_string());
        let orphan = manifest_of(vec![variant.clone()]);
        assert!(matches!(orphan.validate(), Err(BuckethError::InvalidManifest(_))));

        let mut original = entry(EntryKind::MediaOriginal, "media/car.jpg", 'a');
        original.root = Some("car".to_string());
        assert!(manifest_of(vec![original, variant]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_misplaced_entries() {
        let manifest = manifest_of(vec![entry(EntryKind::DatabaseSnapshot, "media/app.db", 'a')]);
        assert!(manifest.validate().is_err());

        let manifest = manifest_of(vec![entry(EntryKind::Resource, "resources/../../etc", 'a')]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_uppercase_fingerprint() {
        let manifest = manifest_of(vec![entry(EntryKind::Resource, "resources/theme.json", 'A')]);
        assert!(matches!(manifest.validate(), Err(BuckethError::InvalidManifest(_))));

        let manifest = manifest_of(vec![entry(EntryKind::Resource, "resources/theme.json", 'a')]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            Manifest::from_json(b"not json"),
            Err(BuckethError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_build_catalogues_dataset() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("library.db");
        let media_dir = temp.path().join("media");
        let resources = temp.path().join("resources");
        fs::create_dir_all(media_dir.join("2024")).unwrap();
        fs::create_dir_all(&resources).unwrap();
        fs::write(&db, b"db image").unwrap();
        fs::write(media_dir.join("2024/car.jpg"), b"original").unwrap();
        fs::write(media_dir.join("2024/car.thumb.jpg"), b"thumb").unwrap();
        fs::write(resources.join("style.css"), b"body {}").unwrap();

        let dataset = LocalDataset::new(Arc::new(FileSnapshot::new(&db)), &media_dir)
            .with_resources(&resources);
        let local = Manifest::build(&dataset).unwrap();
        let manifest = &local.manifest;

        assert_eq!(manifest.entries.len(), 4);
        assert_eq!(manifest.count_of(EntryKind::DatabaseSnapshot), 1);
        let variant = manifest.get("media/2024/car.thumb.jpg").unwrap();
        assert_eq!(variant.kind, EntryKind::MediaVariant);
        assert_eq!(variant.root.as_deref(), Some("2024/car"));
        assert_eq!(variant.variant_tag.as_deref(), Some("thumb.jpg"));
        assert_eq!(variant.local_path(), "2024/car.thumb.jpg");
        assert_eq!(
            manifest.get("db/library.db").unwrap().fingerprint,
            fingerprint_bytes(b"db image")
        );
        assert!(manifest.get("resources/style.css").is_some());
        assert!(manifest.validate().is_ok());
        assert_eq!(local.sources.len(), 4);
    }

    fn arb_entry() -> impl Strategy<Value = Entry> {
        (
            prop_oneof![
                Just(EntryKind::DatabaseSnapshot),
                Just(EntryKind::MediaOriginal),
                Just(EntryKind::MediaVariant),
                Just(EntryKind::Resource),
            ],
            "[a-z0-9]{1,8}(/[a-z0-9._-]{1,12}){0,2}",
            "[0-9a-f]{64}",
            any::<u64>(),
            proptest::option::of("[a-z0-9/]{1,10}"),
            proptest::option::of("[a-z0-9.]{1,10}"),
        )
            .prop_map(|(kind, rest, fingerprint, size, root, variant_tag)| Entry {
                kind,
                path: format!("{}{}", kind.prefix(), rest),
                fingerprint,
                size,
                root,
                variant_tag,
            })
    }

    fn arb_manifest() -> impl Strategy<Value = Manifest> {
        (
            any::<u64>(),
            0i64..4_000_000_000,
            0u32..1_000_000_000,
            proptest::collection::vec(arb_entry(), 0..16),
        )
            .prop_map(|(generation, secs, nanos, entries)| Manifest {
                format: MANIFEST_FORMAT,
                generation,
                created_at: Utc.timestamp_opt(secs, nanos).single().unwrap_or_default(),
                entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
            })
    }

    proptest! {
        #[test]
        fn prop_json_round_trip(manifest in arb_manifest()) {
            let encoded = manifest.to_json().unwrap();
            let decoded = Manifest::from_json(&encoded).unwrap();
            prop_assert_eq!(decoded, manifest);
        }
    }
}
