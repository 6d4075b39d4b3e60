//! Directory traversal for dataset scans.
//!
//! Produces bucket-style relative paths (always `/`-separated) so the same
//! string identifies a file locally and inside a bucket.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Prefix of temporary files written by bucketh itself
pub const TEMP_PREFIX: &str = ".bucketh-";

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File or directory names that are skipped entirely
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: true,
            exclude_names: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".git".to_string(),
            ],
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        if !entry.file_type().is_file() {
            return Ok(None);
        }
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => return Ok(None),
        };

        Ok(Some(Self {
            relative_path: to_bucket_path(relative),
            path,
            size: metadata.len(),
        }))
    }
}

/// Join path components with `/` regardless of platform.
pub fn to_bucket_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a directory tree and collect all regular files, sorted by relative path.
///
/// A missing root yields an empty list: a dataset without resources or
/// without any media yet is valid.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let walker = WalkDir::new(root).follow_links(options.follow_links);

    let mut files = Vec::new();
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_names))
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    file_name.starts_with(TEMP_PREFIX) || names.iter().any(|n| *n == file_name)
}
