//! The local dataset: database, media tree and resources.

pub mod snapshot;

use crate::config::{DatabaseKind, DatasetConfig, MediaConfig};
use crate::media::OriginalMarks;
use crate::utils::errors::Result;
use std::path::PathBuf;
use std::sync::Arc;

pub use snapshot::{FileSnapshot, SnapshotProvider, SqliteSnapshot};

/// Everything a backup reads from and a restore writes into.
#[derive(Debug, Clone)]
pub struct LocalDataset {
    pub database: Arc<dyn SnapshotProvider>,
    pub media_dir: PathBuf,
    pub resources_dir: Option<PathBuf>,
    pub marks: OriginalMarks,
}

impl LocalDataset {
    pub fn new(database: Arc<dyn SnapshotProvider>, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            database,
            media_dir: media_dir.into(),
            resources_dir: None,
            marks: OriginalMarks::ByExtension(
                MediaConfig::default().original_extensions,
            ),
        }
    }

    pub fn with_resources(mut self, resources_dir: impl Into<PathBuf>) -> Self {
        self.resources_dir = Some(resources_dir.into());
        self
    }

    pub fn with_marks(mut self, marks: OriginalMarks) -> Self {
        self.marks = marks;
        self
    }

    pub fn from_config(dataset: &DatasetConfig, media: &MediaConfig) -> Result<Self> {
        let database: Arc<dyn SnapshotProvider> = match dataset.database_kind {
            DatabaseKind::Sqlite => Arc::new(SqliteSnapshot::new(&dataset.database)),
            DatabaseKind::File => Arc::new(FileSnapshot::new(&dataset.database)),
        };
        Ok(Self {
            database,
            media_dir: dataset.media_dir.clone(),
            resources_dir: dataset.resources_dir.clone(),
            marks: OriginalMarks::from_config(media)?,
        })
    }
}
