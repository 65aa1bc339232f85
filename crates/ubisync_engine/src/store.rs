//! Change-set stores and sync bookkeeping.

use crate::error::SyncResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use ubisync_model::{ChangeSet, DeviceId, Timestamp};

/// A per-device, append-only, timestamp-ordered collection of change
/// sets, plus the watermarks synchronization resumes from.
///
/// # Invariants
///
/// - `append` never reorders: sets are queryable in ascending timestamp
///   order
/// - watermark writes are durable before they return; a failure is a
///   local bookkeeping defect and fatal to the running cycle
pub trait ChangeSetStore: Send + Sync {
    /// Persists a locally produced change set.
    ///
    /// # Errors
    ///
    /// [`crate::SyncError::Bookkeeping`] on storage failure; the local
    /// commit must treat this as fatal.
    fn append(&self, set: &ChangeSet) -> SyncResult<()>;

    /// Returns every stored change set with a timestamp strictly greater
    /// than `timestamp`, ascending.
    fn all_newer_than(&self, timestamp: Timestamp) -> SyncResult<Vec<ChangeSet>>;

    /// Returns the most recent change set, if any. Seeds a peer's
    /// "since" position on first contact.
    fn newest(&self) -> SyncResult<Option<ChangeSet>>;

    /// Returns the timestamp of the last fully applied change set from
    /// `peer`, if any.
    fn peer_watermark(&self, peer: &DeviceId) -> SyncResult<Option<Timestamp>>;

    /// Advances the watermark for `peer`. Called only after the change
    /// set at `timestamp` applied successfully.
    fn set_peer_watermark(&self, peer: &DeviceId, timestamp: Timestamp) -> SyncResult<()>;

    /// Returns the timestamp of the last local change set exported to the
    /// shared folder, if any.
    fn last_exported(&self) -> SyncResult<Option<Timestamp>>;

    /// Advances the export watermark.
    fn set_last_exported(&self, timestamp: Timestamp) -> SyncResult<()>;
}

#[derive(Default)]
struct MemoryStoreInner {
    sets: Vec<ChangeSet>,
    peer_watermarks: HashMap<DeviceId, Timestamp>,
    last_exported: Option<Timestamp>,
}

/// An in-memory change-set store for tests and ephemeral documents.
#[derive(Default)]
pub struct MemoryChangeSetStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryChangeSetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored change sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().sets.len()
    }

    /// Returns true if no change sets are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().sets.is_empty()
    }
}

impl ChangeSetStore for MemoryChangeSetStore {
    fn append(&self, set: &ChangeSet) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.sets.push(set.clone());
        inner.sets.sort_by_key(|s| s.timestamp);
        Ok(())
    }

    fn all_newer_than(&self, timestamp: Timestamp) -> SyncResult<Vec<ChangeSet>> {
        Ok(self
            .inner
            .read()
            .sets
            .iter()
            .filter(|s| s.timestamp > timestamp)
            .cloned()
            .collect())
    }

    fn newest(&self) -> SyncResult<Option<ChangeSet>> {
        Ok(self.inner.read().sets.last().cloned())
    }

    fn peer_watermark(&self, peer: &DeviceId) -> SyncResult<Option<Timestamp>> {
        Ok(self.inner.read().peer_watermarks.get(peer).copied())
    }

    fn set_peer_watermark(&self, peer: &DeviceId, timestamp: Timestamp) -> SyncResult<()> {
        self.inner
            .write()
            .peer_watermarks
            .insert(peer.clone(), timestamp);
        Ok(())
    }

    fn last_exported(&self) -> SyncResult<Option<Timestamp>> {
        Ok(self.inner.read().last_exported)
    }

    fn set_last_exported(&self, timestamp: Timestamp) -> SyncResult<()> {
        self.inner.write().last_exported = Some(timestamp);
        Ok(())
    }
}
