//! Progress events for backup and restore.
//!
//! Engines publish on a broadcast channel; a UI (or the CLI) subscribes and
//! renders without ever blocking the operation.

use crate::executor::backup::BackupResult;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BucketEvent {
    #[serde(rename = "backup:started")]
    BackupStarted {
        operation_id: String,
        bucket: String,
        generation: u64,
        entries_to_write: usize,
        bytes_to_write: u64,
    },

    #[serde(rename = "restore:started")]
    RestoreStarted {
        operation_id: String,
        bucket: String,
        generation: u64,
        total_entries: usize,
        total_bytes: u64,
    },

    #[serde(rename = "entry:written")]
    EntryWritten {
        operation_id: String,
        path: String,
        size: u64,
    },

    #[serde(rename = "entry:restored")]
    EntryRestored {
        operation_id: String,
        path: String,
        size: u64,
    },

    #[serde(rename = "entry:failed")]
    EntryFailed {
        operation_id: String,
        path: String,
        error: String,
    },

    #[serde(rename = "operation:progress")]
    Progress(ProgressPayload),

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        operation_id: String,
        result: BackupResult,
    },

    #[serde(rename = "restore:completed")]
    RestoreCompleted {
        operation_id: String,
        generation: u64,
        entries_restored: usize,
        bytes_restored: u64,
    },

    #[serde(rename = "operation:failed")]
    Failed { operation_id: String, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub operation_id: String,
    pub percent: f64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub entries_processed: usize,
    pub total_entries: usize,
    pub speed: String,
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BucketEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish to every subscriber. Having none is not an error.
    pub fn publish(&self, event: BucketEvent) {
        match self.tx.send(event) {
            Ok(count) => trace!("Published event to {} subscriber(s)", count),
            Err(e) => trace!("No subscribers for event: {:?}", e.0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BucketEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
