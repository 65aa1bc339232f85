//! Change sets: the atomic unit of transport and replay.

use crate::change::Change;
use crate::error::{ModelError, ModelResult};
use crate::id::{DeviceId, SyncId};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An ordered, immutable sequence of changes produced by one local commit.
///
/// Change sets group the individual changes of a commit so peers replay
/// a few sets instead of potentially thousands of loose changes. A peer
/// either applies all of a set's changes or none of them.
///
/// # Invariants
///
/// - `changes` is non-empty and preserves generation order; order matters
///   because a relationship-add may reference an entity inserted earlier
///   in the same set
/// - Sets totally order by `(timestamp, device_id)`; equal timestamps
///   from different devices break ties by device identity, which is
///   deterministic but not causal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Device that produced the commit.
    pub device_id: DeviceId,
    /// Commit time.
    pub timestamp: Timestamp,
    /// The changes, in generation order.
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Seals a change set from the pending changes of one commit.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::EmptyChangeSet`] if `changes` is empty; a
    /// commit that produced no changes has nothing to transport.
    pub fn seal(
        device_id: DeviceId,
        timestamp: Timestamp,
        changes: Vec<Change>,
    ) -> ModelResult<Self> {
        if changes.is_empty() {
            return Err(ModelError::EmptyChangeSet);
        }
        Ok(Self {
            device_id,
            timestamp,
            changes,
        })
    }

    /// The key change sets totally order by, across all devices.
    #[must_use]
    pub fn order_key(&self) -> (Timestamp, &DeviceId) {
        (self.timestamp, &self.device_id)
    }

    /// Returns every sync ID this set's changes reference.
    #[must_use]
    pub fn touched_ids(&self) -> BTreeSet<SyncId> {
        let mut ids = BTreeSet::new();
        for change in &self.changes {
            ids.insert(change.object_sync_id.clone());
            if let Some(target) = change.kind.relationship_target() {
                ids.insert(target.clone());
            }
        }
        ids
    }

    /// Encodes the change set to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Encode`] if serialization fails.
    pub fn encode(&self) -> ModelResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| ModelError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes a change set from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Decode`] on malformed input, and
    /// [`ModelError::EmptyChangeSet`] if the decoded set carries no
    /// changes (a protocol violation).
    pub fn decode(bytes: &[u8]) -> ModelResult<Self> {
        let set: ChangeSet = ciborium::de::from_reader(bytes)
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        if set.changes.is_empty() {
            return Err(ModelError::EmptyChangeSet);
        }
        Ok(set)
    }
}

/// Sorts change sets into global replay order: `(timestamp, device_id)`
/// ascending.
pub fn sort_for_replay(sets: &mut [ChangeSet]) {
    sets.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}
