//! Change records: typed, atomic mutation records against a synced entity.

use crate::id::SyncId;
use crate::timestamp::Timestamp;
use crate::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of mutation a [`Change`] records.
///
/// One tagged union instead of a subclass hierarchy keeps serialization
/// exhaustive-match-checked: adding a variant fails to compile every
/// match site that does not handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The entity was inserted; carries a full attribute snapshot.
    Insertion {
        /// Serialized attribute snapshot at insertion time.
        attributes: BTreeMap<String, AttributeValue>,
    },
    /// The entity was deleted; its sync ID becomes a tombstone key.
    Deletion,
    /// One scalar attribute was overwritten (`None` clears it).
    AttributeSet {
        /// Name of the attribute.
        attribute: String,
        /// New value, or `None` to clear.
        value: Option<AttributeValue>,
    },
    /// A target was added to a to-many relationship.
    RelationshipAdd {
        /// Name of the relationship.
        relationship: String,
        /// Entity name of the target.
        target_entity: String,
        /// Sync ID of the target.
        target_id: SyncId,
    },
    /// A target was removed from a to-many relationship.
    RelationshipRemove {
        /// Name of the relationship.
        relationship: String,
        /// Entity name of the target.
        target_entity: String,
        /// Sync ID of the target.
        target_id: SyncId,
    },
}

impl ChangeKind {
    /// Returns a short name for logs and reports.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::Insertion { .. } => "insertion",
            ChangeKind::Deletion => "deletion",
            ChangeKind::AttributeSet { .. } => "attribute-set",
            ChangeKind::RelationshipAdd { .. } => "relationship-add",
            ChangeKind::RelationshipRemove { .. } => "relationship-remove",
        }
    }

    /// Returns the relationship target's sync ID, for relationship kinds.
    #[must_use]
    pub fn relationship_target(&self) -> Option<&SyncId> {
        match self {
            ChangeKind::RelationshipAdd { target_id, .. }
            | ChangeKind::RelationshipRemove { target_id, .. } => Some(target_id),
            _ => None,
        }
    }
}

/// A record of one atomic mutation against a synced entity.
///
/// The change owns only the entity's [`SyncId`], never a handle to the
/// entity itself; resolution against the live graph happens at replay
/// time through a document-local lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Sync ID of the mutated entity.
    pub object_sync_id: SyncId,
    /// Entity name (type) of the mutated entity.
    pub entity_name: String,
    /// Wall-clock time the change was recorded.
    pub timestamp: Timestamp,
    /// The mutation itself.
    pub kind: ChangeKind,
}

impl Change {
    /// Creates a new change record.
    pub fn new(
        object_sync_id: SyncId,
        entity_name: impl Into<String>,
        timestamp: Timestamp,
        kind: ChangeKind,
    ) -> Self {
        Self {
            object_sync_id,
            entity_name: entity_name.into(),
            timestamp,
            kind,
        }
    }

    /// Creates an insertion change with the given attribute snapshot.
    pub fn insertion(
        object_sync_id: SyncId,
        entity_name: impl Into<String>,
        timestamp: Timestamp,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self::new(
            object_sync_id,
            entity_name,
            timestamp,
            ChangeKind::Insertion { attributes },
        )
    }

    /// Creates a deletion change.
    pub fn deletion(
        object_sync_id: SyncId,
        entity_name: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(object_sync_id, entity_name, timestamp, ChangeKind::Deletion)
    }

    /// Creates an attribute-set change.
    pub fn attribute_set(
        object_sync_id: SyncId,
        entity_name: impl Into<String>,
        timestamp: Timestamp,
        attribute: impl Into<String>,
        value: Option<AttributeValue>,
    ) -> Self {
        Self::new(
            object_sync_id,
            entity_name,
            timestamp,
            ChangeKind::AttributeSet {
                attribute: attribute.into(),
                value,
            },
        )
    }

    /// Returns true if this change references `sync_id`, either as the
    /// mutated object or as a relationship target.
    #[must_use]
    pub fn references(&self, sync_id: &SyncId) -> bool {
        if &self.object_sync_id == sync_id {
            return true;
        }
        self.kind.relationship_target() == Some(sync_id)
    }
}
