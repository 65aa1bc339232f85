//! Device and document discovery over the shared folder.

use crate::error::{SyncError, SyncResult};
use crate::transport::{FolderTransport, RemotePath};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use ubisync_model::{DeviceId, DocumentId, StoreManifest};

const CHANGES_DIR: &str = "changes";
const WHOLESTORE_DIR: &str = "wholestore";
const MANIFEST_FILE: &str = "manifest.cbor";

/// Discovery and path lookup over the shared folder's layout:
///
/// ```text
/// <root>/<document_id>/changes/<device_id>/changeset-<ts>.cbor
/// <root>/<document_id>/wholestore/<device_id>/{<payload>, manifest.cbor}
/// ```
///
/// Pure discovery, no merge logic. Listing may block on slow
/// shared-storage metadata; never call from a latency-sensitive thread.
pub struct DeviceRegistry<T: FolderTransport> {
    transport: Arc<T>,
    known_documents: RwLock<HashSet<DocumentId>>,
}

impl<T: FolderTransport> DeviceRegistry<T> {
    /// Creates a registry over the given transport.
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            known_documents: RwLock::new(HashSet::new()),
        }
    }

    /// Enumerates every document visible in the shared folder.
    pub fn available_document_ids(&self) -> SyncResult<Vec<DocumentId>> {
        let names = self.transport.list_dir(&RemotePath::root())?;
        Ok(names.into_iter().map(DocumentId::new).collect())
    }

    /// Enumerates documents and returns the ones not seen by a previous
    /// call. The caller forwards these to its delegate.
    pub fn discover_new_documents(&self) -> SyncResult<Vec<DocumentId>> {
        let available = self.available_document_ids()?;
        let mut known = self.known_documents.write();
        let fresh: Vec<DocumentId> = available
            .into_iter()
            .filter(|id| known.insert(id.clone()))
            .collect();
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "discovered new documents");
        }
        Ok(fresh)
    }

    /// Enumerates the devices that have published change sets for
    /// `document`.
    pub fn devices(&self, document: &DocumentId) -> SyncResult<Vec<DeviceId>> {
        let dir = RemotePath::root().join(document.as_str()).join(CHANGES_DIR);
        let names = self.transport.list_dir(&dir)?;
        Ok(names.into_iter().map(DeviceId::new).collect())
    }

    /// The directory a device publishes its change sets into.
    #[must_use]
    pub fn changeset_dir(&self, document: &DocumentId, device: &DeviceId) -> RemotePath {
        RemotePath::root()
            .join(document.as_str())
            .join(CHANGES_DIR)
            .join(device.as_str())
    }

    /// The directory a device publishes whole-store uploads into.
    #[must_use]
    pub fn wholestore_dir(&self, document: &DocumentId, device: &DeviceId) -> RemotePath {
        RemotePath::root()
            .join(document.as_str())
            .join(WHOLESTORE_DIR)
            .join(device.as_str())
    }

    /// The path of a device's whole-store manifest.
    #[must_use]
    pub fn manifest_path(&self, document: &DocumentId, device: &DeviceId) -> RemotePath {
        self.wholestore_dir(document, device).join(MANIFEST_FILE)
    }

    /// Finds the newest whole-store upload for `document` across every
    /// device, by the manifests' reported upload timestamps.
    ///
    /// Devices with a missing or undecodable manifest are skipped with a
    /// warning; they may still be uploading.
    ///
    /// # Errors
    ///
    /// [`SyncError::NoWholeStore`] if no device has a readable manifest.
    pub fn newest_whole_store(&self, document: &DocumentId) -> SyncResult<StoreManifest> {
        let dir = RemotePath::root()
            .join(document.as_str())
            .join(WHOLESTORE_DIR);
        let devices = self.transport.list_dir(&dir)?;

        let mut newest: Option<StoreManifest> = None;
        for name in devices {
            let device = DeviceId::new(name);
            let manifest_path = self.manifest_path(document, &device);
            let bytes = match self.transport.read_file(&manifest_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(device = %device, "skipping unreadable whole-store manifest: {e}");
                    continue;
                }
            };
            match StoreManifest::decode(&bytes) {
                Ok(manifest) => {
                    let is_newer = newest
                        .as_ref()
                        .is_none_or(|best| manifest.uploaded_at > best.uploaded_at);
                    if is_newer {
                        newest = Some(manifest);
                    }
                }
                Err(e) => warn!(device = %device, "skipping undecodable manifest: {e}"),
            }
        }

        newest.ok_or_else(|| SyncError::NoWholeStore(document.clone()))
    }
}
