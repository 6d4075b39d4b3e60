//! Media variant index.
//!
//! Originals and their derived files share a directory and a name prefix:
//! `car.jpg` is the original, `car.thumb.jpg` and `car.png` are variants.
//! [`index`] turns that convention into explicit [`MediaAsset`] aggregates
//! so nothing downstream has to re-derive it from file names.

use crate::config::MediaConfig;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{BuckethError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tag given to a variant whose name equals its root exactly
const BARE_TAG: &str = "bare";

/// How originals are recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginalMarks {
    /// Relative paths (under the media dir) recorded as originals by the database
    Explicit(BTreeSet<String>),
    /// Per name group, the `<stem>.<ext>` file with the most preferred extension
    ByExtension(Vec<String>),
}

impl OriginalMarks {
    /// Marks described by the media configuration.
    pub fn from_config(config: &MediaConfig) -> Result<Self> {
        match &config.originals_list {
            Some(path) => Self::from_list_file(path),
            None => Ok(OriginalMarks::ByExtension(
                config
                    .original_extensions
                    .iter()
                    .map(|e| e.to_ascii_lowercase())
                    .collect(),
            )),
        }
    }

    /// One relative path per line; blank lines and `#` comments are ignored.
    pub fn from_list_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let originals = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.trim_start_matches("./").to_string())
            .collect();
        Ok(OriginalMarks::Explicit(originals))
    }
}

/// A file inside the media directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    /// Path relative to the media directory, `/`-separated
    pub relative_path: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
}

impl MediaFile {
    fn name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// A derived file: alternate format or size of an original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaVariant {
    pub file: MediaFile,
    /// Name remainder after the root, e.g. `thumb.jpg` or `png`
    pub tag: String,
}

/// One original plus every variant sharing its root name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Root name including its directory, e.g. `2024/car`
    pub root: String,
    pub original: MediaFile,
    pub variants: Vec<MediaVariant>,
}

impl MediaAsset {
    /// The original followed by all variants.
    pub fn files(&self) -> impl Iterator<Item = &MediaFile> {
        std::iter::once(&self.original).chain(self.variants.iter().map(|v| &v.file))
    }
}

/// Result of indexing a media directory.
#[derive(Debug, Clone, Default)]
pub struct MediaIndex {
    pub assets: BTreeMap<String, MediaAsset>,
    /// Files that belong to no original (only possible with explicit marks)
    pub unclaimed: Vec<MediaFile>,
}

impl MediaIndex {
    /// Every file representing the asset with this root.
    pub fn resolve_root(&self, root: &str) -> Option<Vec<&MediaFile>> {
        self.assets.get(root).map(|asset| asset.files().collect())
    }

    pub fn variant_count(&self) -> usize {
        self.assets.values().map(|a| a.variants.len()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.assets
            .values()
            .flat_map(|a| a.files())
            .map(|f| f.size)
            .sum()
    }
}

/// Index `media_dir` into assets keyed by root name.
///
/// Each directory is indexed on its own. Fails with `AmbiguousRoot` when two
/// originals in one directory have roots in a prefix relationship.
pub fn index(media_dir: &Path, marks: &OriginalMarks) -> Result<MediaIndex> {
    let files = walk_directory(media_dir, &WalkOptions::default())?;

    let mut by_dir: BTreeMap<String, Vec<MediaFile>> = BTreeMap::new();
    for file in files {
        let dir = match file.relative_path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        };
        by_dir.entry(dir).or_default().push(MediaFile {
            relative_path: file.relative_path,
            path: file.path,
            size: file.size,
        });
    }

    let mut result = MediaIndex::default();
    for (dir, files) in by_dir {
        index_directory(&dir, files, marks, &mut result)?;
    }

    debug!(
        "Indexed {} media assets ({} variants, {} unclaimed) in {}",
        result.assets.len(),
        result.variant_count(),
        result.unclaimed.len(),
        media_dir.display()
    );

    Ok(result)
}

fn index_directory(
    dir: &str,
    files: Vec<MediaFile>,
    marks: &OriginalMarks,
    result: &mut MediaIndex,
) -> Result<()> {
    let original_paths: BTreeSet<String> = match marks {
        OriginalMarks::Explicit(set) => files
            .iter()
            .filter(|f| set.contains(&f.relative_path))
            .map(|f| f.relative_path.clone())
            .collect(),
        OriginalMarks::ByExtension(preference) => pick_by_extension(&files, preference),
    };

    let (originals, others): (Vec<MediaFile>, Vec<MediaFile>) = files
        .into_iter()
        .partition(|f| original_paths.contains(&f.relative_path));

    // Sorted roots: a prefix relationship always shows up between neighbours.
    let mut roots: Vec<(String, MediaFile)> = originals
        .into_iter()
        .map(|f| (root_of(f.name()).to_string(), f))
        .collect();
    roots.sort_by(|a, b| a.0.cmp(&b.0));
    for pair in roots.windows(2) {
        if pair[1].0.starts_with(pair[0].0.as_str()) {
            return Err(BuckethError::AmbiguousRoot {
                first: pair[0].1.relative_path.clone(),
                second: pair[1].1.relative_path.clone(),
            });
        }
    }

    let mut assets: Vec<MediaAsset> = roots
        .into_iter()
        .map(|(root, original)| MediaAsset {
            root: qualify(dir, &root),
            original,
            variants: Vec::new(),
        })
        .collect();

    for file in others {
        let name = file.name().to_string();
        let owner = assets.iter_mut().find(|asset| {
            let root = asset.root.rsplit('/').next().unwrap_or(&asset.root);
            name.starts_with(root)
        });
        match owner {
            Some(asset) => {
                let root_len = asset.root.rsplit('/').next().unwrap_or(&asset.root).len();
                let tag = name[root_len..].trim_start_matches(['.', '_', '-']);
                let tag = if tag.is_empty() { BARE_TAG } else { tag };
                asset.variants.push(MediaVariant {
                    tag: tag.to_string(),
                    file,
                });
            }
            None => result.unclaimed.push(file),
        }
    }

    for mut asset in assets {
        asset.variants.sort_by(|a, b| a.file.relative_path.cmp(&b.file.relative_path));
        result.assets.insert(asset.root.clone(), asset);
    }

    Ok(())
}

/// Name without its final extension.
fn root_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

fn qualify(dir: &str, root: &str) -> String {
    if dir.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", dir, root)
    }
}

/// Group files by the name up to the first `.` and pick one original per group.
fn pick_by_extension(files: &[MediaFile], preference: &[String]) -> BTreeSet<String> {
    let mut groups: BTreeMap<&str, Vec<&MediaFile>> = BTreeMap::new();
    for file in files {
        let name = file.name();
        if name.starts_with('.') {
            continue;
        }
        let stem = name.split('.').next().unwrap_or(name);
        groups.entry(stem).or_default().push(file);
    }

    let rank = |name: &str| -> usize {
        let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
        ext.and_then(|ext| preference.iter().position(|p| *p == ext))
            .unwrap_or(preference.len())
    };

    groups
        .into_values()
        .filter_map(|members| {
            let simple = members
                .iter()
                .filter(|f| f.name().matches('.').count() <= 1)
                .min_by(|a, b| {
                    rank(a.name())
                        .cmp(&rank(b.name()))
                        .then_with(|| a.name().cmp(b.name()))
                });
            let chosen = simple.or_else(|| {
                members.iter().min_by(|a, b| {
                    a.name()
                        .len()
                        .cmp(&b.name().len())
                        .then_with(|| a.name().cmp(b.name()))
                })
            });
            chosen.map(|f| f.relative_path.clone())
        })
        .collect()
}
