//! Bucket addressing and locking.
//!
//! Bucket layout (identical for both backends):
//!
//! ```text
//! manifest.json
//! db/<snapshot-name>
//! media/<root>.<ext>
//! media/<root>.<variant>.<ext>
//! resources/...
//! ```

pub mod lock;
pub mod path;

pub use lock::{Lease, LockRegistry};
pub use path::{BucketKind, BucketPath, PathResolver, Scheme};

/// Manifest entry name
pub const MANIFEST_PATH: &str = "manifest.json";
/// Prefix for the database snapshot
pub const DB_PREFIX: &str = "db/";
/// Prefix for original and variant media
pub const MEDIA_PREFIX: &str = "media/";
/// Prefix for application resources
pub const RESOURCES_PREFIX: &str = "resources/";
