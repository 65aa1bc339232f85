//! Configuration for the sync coordinator.

use std::time::Duration;
use ubisync_model::{DeviceId, DocumentId};

/// Configuration for one document's synchronization.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The document being synchronized.
    pub document_id: DocumentId,
    /// This device's identity. Also names the device's sub-path in the
    /// shared folder.
    pub device_id: DeviceId,
    /// File name of whole-store payloads uploaded by this device.
    pub whole_store_file_name: String,
    /// Interval for periodic sync, if the host drives sync on a timer.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a configuration for the given document and device.
    pub fn new(document_id: DocumentId, device_id: DeviceId) -> Self {
        Self {
            document_id,
            device_id,
            whole_store_file_name: "document.bin".to_string(),
            sync_interval: None,
        }
    }

    /// Sets the whole-store payload file name.
    #[must_use]
    pub fn with_whole_store_file_name(mut self, name: impl Into<String>) -> Self {
        self.whole_store_file_name = name.into();
        self
    }

    /// Sets the interval for periodic sync.
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}
