//! Synced entity representation.

use std::collections::{BTreeMap, BTreeSet};
use ubisync_model::{AttributeValue, SyncId, Timestamp};

/// A replicated entity in the local object graph.
///
/// The entity carries, besides its attributes and to-many relationships,
/// a per-attribute last-write timestamp. The stamps are what make
/// last-write-wins-by-field decidable when change sets arrive out of
/// order: a replayed write older than the stamp is stale and suppressed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedEntity {
    sync_id: SyncId,
    entity_name: String,
    attributes: BTreeMap<String, AttributeValue>,
    attribute_stamps: BTreeMap<String, Timestamp>,
    relationships: BTreeMap<String, BTreeSet<SyncId>>,
}

impl SyncedEntity {
    /// Creates a new entity with the given attribute snapshot, stamping
    /// every attribute with `timestamp`.
    pub fn new(
        sync_id: SyncId,
        entity_name: impl Into<String>,
        attributes: BTreeMap<String, AttributeValue>,
        timestamp: Timestamp,
    ) -> Self {
        let attribute_stamps = attributes
            .keys()
            .map(|name| (name.clone(), timestamp))
            .collect();
        Self {
            sync_id,
            entity_name: entity_name.into(),
            attributes,
            attribute_stamps,
            relationships: BTreeMap::new(),
        }
    }

    /// The entity's sync ID.
    #[must_use]
    pub fn sync_id(&self) -> &SyncId {
        &self.sync_id
    }

    /// The entity's name (type).
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Returns the value of an attribute, if set.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Returns all attributes.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Returns the last-write timestamp of an attribute, if it was ever
    /// written.
    #[must_use]
    pub fn attribute_stamp(&self, name: &str) -> Option<Timestamp> {
        self.attribute_stamps.get(name).copied()
    }

    /// Returns the members of a to-many relationship.
    #[must_use]
    pub fn related(&self, relationship: &str) -> Option<&BTreeSet<SyncId>> {
        self.relationships.get(relationship)
    }

    /// Returns true if `target` is a member of `relationship`.
    #[must_use]
    pub fn is_related(&self, relationship: &str, target: &SyncId) -> bool {
        self.relationships
            .get(relationship)
            .is_some_and(|members| members.contains(target))
    }

    /// Writes an attribute (or clears it with `None`), stamping it with
    /// `timestamp`. The staleness decision belongs to the graph, not the
    /// entity; this always applies.
    pub(crate) fn write_attribute(
        &mut self,
        name: &str,
        value: Option<AttributeValue>,
        timestamp: Timestamp,
    ) {
        match value {
            Some(v) => {
                self.attributes.insert(name.to_string(), v);
            }
            None => {
                self.attributes.remove(name);
            }
        }
        self.attribute_stamps.insert(name.to_string(), timestamp);
    }

    /// Adds a target to a to-many relationship. Returns true if membership
    /// changed.
    pub(crate) fn add_related(&mut self, relationship: &str, target: SyncId) -> bool {
        self.relationships
            .entry(relationship.to_string())
            .or_default()
            .insert(target)
    }

    /// Removes a target from a to-many relationship. Returns true if
    /// membership changed.
    pub(crate) fn remove_related(&mut self, relationship: &str, target: &SyncId) -> bool {
        self.relationships
            .get_mut(relationship)
            .is_some_and(|members| members.remove(target))
    }

    /// Removes `target` from every relationship set. Returns true if any
    /// membership changed.
    ///
    /// Sets emptied by the removal are dropped, so an owner that lost its
    /// only member compares equal to one that never had it.
    pub(crate) fn purge_related(&mut self, target: &SyncId) -> bool {
        let mut changed = false;
        for members in self.relationships.values_mut() {
            changed |= members.remove(target);
        }
        self.relationships.retain(|_, members| !members.is_empty());
        changed
    }
}
