//! Bucket path parsing.
//!
//! A bucket is addressed as `<scheme>://<location>.<suffix>`. The suffix
//! decides the backend (`bk` = directory tree, `bkz` = single zip archive);
//! the scheme is either `file` or the name of a configured cloud provider.
//! Bare paths without a scheme are local.

use crate::config::CloudConfig;
use crate::utils::errors::{BuckethError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

const SCHEME_SEPARATOR: &str = "://";
const LOCAL_SCHEME: &str = "file";

/// Where a bucket lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Local,
    Cloud(String),
}

impl Scheme {
    pub fn name(&self) -> &str {
        match self {
            Scheme::Local => LOCAL_SCHEME,
            Scheme::Cloud(name) => name,
        }
    }
}

/// Physical representation of a bucket, fixed by the path suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketKind {
    /// `.bk`: a directory whose children are the entries
    Directory,
    /// `.bkz`: exactly one zip archive
    Archive,
}

impl BucketKind {
    pub fn suffix(self) -> &'static str {
        match self {
            BucketKind::Directory => "bk",
            BucketKind::Archive => "bkz",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix.to_ascii_lowercase().as_str() {
            "bk" => Some(BucketKind::Directory),
            "bkz" => Some(BucketKind::Archive),
            _ => None,
        }
    }
}

/// A syntactically valid bucket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketPath {
    pub scheme: Scheme,
    /// Location without the suffix
    pub location: String,
    pub kind: BucketKind,
}

impl BucketPath {
    /// Map the bucket onto the local filesystem.
    ///
    /// Cloud buckets live under the provider's mounted sync folder.
    pub fn physical_path(&self, cloud: &CloudConfig) -> Result<PathBuf> {
        let file_name = format!("{}.{}", self.location, self.kind.suffix());
        match &self.scheme {
            Scheme::Local => Ok(PathBuf::from(file_name)),
            Scheme::Cloud(name) => {
                let root = cloud
                    .providers
                    .get(name)
                    .ok_or_else(|| BuckethError::UnsupportedScheme(name.clone()))?;
                Ok(root.join(file_name.trim_start_matches('/')))
            }
        }
    }
}

impl fmt::Display for BucketPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}.{}",
            self.scheme.name(),
            SCHEME_SEPARATOR,
            self.location,
            self.kind.suffix()
        )
    }
}

/// Parses bucket addresses against the set of configured cloud providers.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    providers: BTreeSet<String>,
}

impl PathResolver {
    pub fn new(cloud: &CloudConfig) -> Self {
        Self {
            providers: cloud.providers.keys().cloned().collect(),
        }
    }

    /// Classify `raw` without touching the filesystem or network.
    pub fn resolve(&self, raw: &str) -> Result<BucketPath> {
        let raw = raw.trim();
        let (scheme, rest) = match raw.split_once(SCHEME_SEPARATOR) {
            Some((scheme, rest)) => (self.scheme(scheme)?, rest),
            None => (Scheme::Local, raw),
        };

        let rest = rest.trim_end_matches('/');
        let file_name = rest.rsplit('/').next().unwrap_or(rest);
        let (stem, suffix) = file_name
            .rsplit_once('.')
            .ok_or_else(|| BuckethError::InvalidPathKind(raw.to_string()))?;
        let kind = BucketKind::from_suffix(suffix)
            .ok_or_else(|| BuckethError::InvalidPathKind(raw.to_string()))?;
        if stem.is_empty() {
            return Err(BuckethError::InvalidPathKind(raw.to_string()));
        }

        let location = &rest[..rest.len() - suffix.len() - 1];

        Ok(BucketPath {
            scheme,
            location: location.to_string(),
            kind,
        })
    }

    fn scheme(&self, name: &str) -> Result<Scheme> {
        if name.eq_ignore_ascii_case(LOCAL_SCHEME) {
            return Ok(Scheme::Local);
        }
        if self.providers.contains(name) {
            return Ok(Scheme::Cloud(name.to_string()));
        }
        Err(BuckethError::UnsupportedScheme(name.to_string()))
    }
}
