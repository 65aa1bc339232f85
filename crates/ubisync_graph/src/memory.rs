//! In-memory object graph.

use crate::entity::SyncedEntity;
use crate::error::{GraphError, GraphResult};
use crate::graph::{LocalChangeSource, ObjectGraph, WriteContext, WriteOrigin};
use crate::recorder::ChangeRecorder;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use ubisync_model::{AttributeValue, Change, ChangeKind, ChangeSet, DeviceId, SyncId, Timestamp};

type DefaultsFn = Box<dyn Fn(&mut BTreeMap<String, AttributeValue>) + Send + Sync>;

#[derive(Default)]
struct GraphInner {
    entities: HashMap<SyncId, SyncedEntity>,
    tombstones: HashSet<SyncId>,
}

/// An in-memory object graph.
///
/// This is the reference implementation of [`ObjectGraph`] and
/// [`LocalChangeSource`], used by the engine's tests and suitable for
/// ephemeral documents. Hosts with real persistence implement the traits
/// against their own store.
///
/// # Thread Safety
///
/// All state lives under a single `RwLock`, so mutations from one commit
/// are never interleaved with replay observing half-applied state.
pub struct MemoryGraph {
    inner: RwLock<GraphInner>,
    recorder: ChangeRecorder,
    defaults: RwLock<HashMap<String, DefaultsFn>>,
}

impl MemoryGraph {
    /// Creates an empty graph recording changes for `device_id`.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            recorder: ChangeRecorder::new(device_id),
            defaults: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a default-value initializer for organically inserted
    /// entities of `entity_name`.
    ///
    /// Replayed insertions skip the initializer: the remote snapshot
    /// carries every value, and defaults that create further objects or
    /// relationships would emit spurious changes.
    pub fn register_defaults<F>(&self, entity_name: impl Into<String>, f: F)
    where
        F: Fn(&mut BTreeMap<String, AttributeValue>) + Send + Sync + 'static,
    {
        self.defaults.write().insert(entity_name.into(), Box::new(f));
    }

    /// Returns a copy of every live entity, keyed by sync ID.
    ///
    /// Used by tests to compare end states between devices.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<SyncId, SyncedEntity> {
        self.inner
            .read()
            .entities
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    /// Returns true if the graph holds no live entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entities.is_empty()
    }

    fn record_if_organic(&self, ctx: &WriteContext, change: Change) {
        if ctx.origin == WriteOrigin::Organic {
            self.recorder.record(change);
        }
    }
}

impl ObjectGraph for MemoryGraph {
    fn insert(
        &self,
        entity_name: &str,
        sync_id: SyncId,
        attributes: BTreeMap<String, AttributeValue>,
        ctx: &WriteContext,
    ) -> GraphResult<()> {
        let mut inner = self.inner.write();
        if inner.tombstones.contains(&sync_id) {
            return Err(GraphError::Tombstoned(sync_id));
        }
        if let Some(existing) = inner.entities.get(&sync_id) {
            if existing.entity_name() != entity_name {
                return Err(GraphError::EntityKindMismatch {
                    sync_id,
                    expected: entity_name.to_string(),
                    actual: existing.entity_name().to_string(),
                });
            }
            return Err(GraphError::DuplicateId(sync_id));
        }

        let mut attrs = BTreeMap::new();
        if ctx.origin == WriteOrigin::Organic {
            if let Some(init) = self.defaults.read().get(entity_name) {
                init(&mut attrs);
            }
        }
        attrs.extend(attributes);

        let entity = SyncedEntity::new(sync_id.clone(), entity_name, attrs.clone(), ctx.timestamp);
        inner.entities.insert(sync_id.clone(), entity);
        drop(inner);

        self.record_if_organic(
            ctx,
            Change::insertion(sync_id, entity_name, ctx.timestamp, attrs),
        );
        Ok(())
    }

    fn delete(&self, sync_id: &SyncId, ctx: &WriteContext) -> GraphResult<()> {
        let mut inner = self.inner.write();
        let removed = inner.entities.remove(sync_id);
        // Tombstone regardless of presence, so stale changes for this ID
        // are suppressed even when the deletion arrived first.
        inner.tombstones.insert(sync_id.clone());
        // A dead ID never stays a member: every live entity drops it from
        // its relationship sets. Every device runs this, organic or
        // replay, so no removal change needs to be recorded.
        for entity in inner.entities.values_mut() {
            entity.purge_related(sync_id);
        }
        drop(inner);

        if let Some(entity) = removed {
            self.record_if_organic(
                ctx,
                Change::deletion(sync_id.clone(), entity.entity_name(), ctx.timestamp),
            );
        }
        Ok(())
    }

    fn set_attribute(
        &self,
        sync_id: &SyncId,
        attribute: &str,
        value: Option<AttributeValue>,
        ctx: &WriteContext,
    ) -> GraphResult<bool> {
        let mut inner = self.inner.write();
        if inner.tombstones.contains(sync_id) {
            return Err(GraphError::Tombstoned(sync_id.clone()));
        }
        let entity = inner
            .entities
            .get_mut(sync_id)
            .ok_or_else(|| GraphError::NotFound(sync_id.clone()))?;

        // Last write wins per field: a replayed write older than the
        // field's current stamp is stale.
        if ctx.is_replay() {
            if let Some(stamp) = entity.attribute_stamp(attribute) {
                if ctx.timestamp < stamp {
                    debug!(
                        sync_id = %sync_id,
                        attribute,
                        "suppressing stale attribute write ({} < {})",
                        ctx.timestamp,
                        stamp
                    );
                    return Ok(false);
                }
            }
        }

        let entity_name = entity.entity_name().to_string();
        entity.write_attribute(attribute, value.clone(), ctx.timestamp);
        drop(inner);

        self.record_if_organic(
            ctx,
            Change::attribute_set(sync_id.clone(), entity_name, ctx.timestamp, attribute, value),
        );
        Ok(true)
    }

    fn add_related(
        &self,
        sync_id: &SyncId,
        relationship: &str,
        target_entity: &str,
        target_id: SyncId,
        ctx: &WriteContext,
    ) -> GraphResult<bool> {
        let mut inner = self.inner.write();
        if inner.tombstones.contains(sync_id) {
            return Err(GraphError::Tombstoned(sync_id.clone()));
        }
        // A tombstoned target can never become a member again.
        if inner.tombstones.contains(&target_id) {
            return Err(GraphError::Tombstoned(target_id));
        }
        let entity = inner
            .entities
            .get_mut(sync_id)
            .ok_or_else(|| GraphError::NotFound(sync_id.clone()))?;

        let entity_name = entity.entity_name().to_string();
        let changed = entity.add_related(relationship, target_id.clone());
        drop(inner);

        if changed {
            self.record_if_organic(
                ctx,
                Change::new(
                    sync_id.clone(),
                    entity_name,
                    ctx.timestamp,
                    ChangeKind::RelationshipAdd {
                        relationship: relationship.to_string(),
                        target_entity: target_entity.to_string(),
                        target_id,
                    },
                ),
            );
        }
        Ok(changed)
    }

    fn remove_related(
        &self,
        sync_id: &SyncId,
        relationship: &str,
        target_entity: &str,
        target_id: &SyncId,
        ctx: &WriteContext,
    ) -> GraphResult<bool> {
        let mut inner = self.inner.write();
        if inner.tombstones.contains(sync_id) {
            return Err(GraphError::Tombstoned(sync_id.clone()));
        }
        let entity = inner
            .entities
            .get_mut(sync_id)
            .ok_or_else(|| GraphError::NotFound(sync_id.clone()))?;

        let entity_name = entity.entity_name().to_string();
        let changed = entity.remove_related(relationship, target_id);
        drop(inner);

        if changed {
            self.record_if_organic(
                ctx,
                Change::new(
                    sync_id.clone(),
                    entity_name,
                    ctx.timestamp,
                    ChangeKind::RelationshipRemove {
                        relationship: relationship.to_string(),
                        target_entity: target_entity.to_string(),
                        target_id: target_id.clone(),
                    },
                ),
            );
        }
        Ok(changed)
    }

    fn get(&self, sync_id: &SyncId) -> Option<SyncedEntity> {
        self.inner.read().entities.get(sync_id).cloned()
    }

    fn contains(&self, sync_id: &SyncId) -> bool {
        self.inner.read().entities.contains_key(sync_id)
    }

    fn is_tombstoned(&self, sync_id: &SyncId) -> bool {
        self.inner.read().tombstones.contains(sync_id)
    }

    fn entity_ids(&self) -> Vec<SyncId> {
        self.inner.read().entities.keys().cloned().collect()
    }
}

impl LocalChangeSource for MemoryGraph {
    fn seal_pending(&self, commit_time: Timestamp) -> Option<ChangeSet> {
        self.recorder.seal(commit_time)
    }

    fn pending_count(&self) -> usize {
        self.recorder.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> MemoryGraph {
        MemoryGraph::new(DeviceId::from("dev-a"))
    }

    fn organic(ts: u64) -> WriteContext {
        WriteContext::organic_at(Timestamp::from_millis(ts))
    }

    fn replay(ts: u64) -> WriteContext {
        WriteContext::replay(Timestamp::from_millis(ts))
    }

    #[test]
    fn organic_insert_records_a_change() {
        let g = graph();
        g.insert(
            "Item",
            SyncId::from("u1"),
            BTreeMap::from([("name".to_string(), "a".into())]),
            &organic(100),
        )
        .unwrap();

        assert_eq!(g.pending_count(), 1);
        let set = g.seal_pending(Timestamp::from_millis(100)).unwrap();
        assert!(matches!(set.changes[0].kind, ChangeKind::Insertion { .. }));
    }

    #[test]
    fn replay_insert_records_nothing() {
        let g = graph();
        g.insert("Item", SyncId::from("u1"), BTreeMap::new(), &replay(100))
            .unwrap();
        assert_eq!(g.pending_count(), 0);
        assert!(g.contains(&SyncId::from("u1")));
    }

    #[test]
    fn defaults_apply_only_to_organic_inserts() {
        let g = graph();
        g.register_defaults("Item", |attrs| {
            attrs.insert("status".to_string(), "new".into());
        });

        g.insert("Item", SyncId::from("organic"), BTreeMap::new(), &organic(1))
            .unwrap();
        g.insert("Item", SyncId::from("synced"), BTreeMap::new(), &replay(1))
            .unwrap();

        let organic_entity = g.get(&SyncId::from("organic")).unwrap();
        assert_eq!(
            organic_entity.attribute("status").and_then(|v| v.as_text()),
            Some("new")
        );
        assert_eq!(g.get(&SyncId::from("synced")).unwrap().attribute("status"), None);
    }

    #[test]
    fn explicit_attributes_override_defaults() {
        let g = graph();
        g.register_defaults("Item", |attrs| {
            attrs.insert("status".to_string(), "new".into());
        });
        g.insert(
            "Item",
            SyncId::from("u1"),
            BTreeMap::from([("status".to_string(), "done".into())]),
            &organic(1),
        )
        .unwrap();

        let e = g.get(&SyncId::from("u1")).unwrap();
        assert_eq!(e.attribute("status").and_then(|v| v.as_text()), Some("done"));
    }

    #[test]
    fn duplicate_insert_is_an_error() {
        let g = graph();
        g.insert("Item", SyncId::from("u1"), BTreeMap::new(), &organic(1))
            .unwrap();
        let err = g
            .insert("Item", SyncId::from("u1"), BTreeMap::new(), &organic(2))
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateId(_)));

        // Reusing the ID under a different entity name is its own error.
        let err = g
            .insert("Folder", SyncId::from("u1"), BTreeMap::new(), &organic(3))
            .unwrap_err();
        assert!(matches!(err, GraphError::EntityKindMismatch { .. }));
    }

    #[test]
    fn deletion_tombstones_forever() {
        let g = graph();
        let id = SyncId::from("u1");
        g.insert("Item", id.clone(), BTreeMap::new(), &organic(1))
            .unwrap();
        g.delete(&id, &organic(2)).unwrap();

        assert!(!g.contains(&id));
        assert!(g.is_tombstoned(&id));

        // Resurrection is disallowed.
        let err = g
            .insert("Item", id.clone(), BTreeMap::new(), &organic(3))
            .unwrap_err();
        assert!(matches!(err, GraphError::Tombstoned(_)));
    }

    #[test]
    fn deleting_an_absent_id_still_tombstones() {
        let g = graph();
        let id = SyncId::from("never-seen");
        g.delete(&id, &replay(5)).unwrap();
        assert!(g.is_tombstoned(&id));
        // No entity was removed, so nothing was recorded.
        assert_eq!(g.pending_count(), 0);
    }

    #[test]
    fn stale_replay_attribute_write_is_suppressed() {
        let g = graph();
        let id = SyncId::from("u1");
        g.insert("Item", id.clone(), BTreeMap::new(), &replay(100))
            .unwrap();

        assert!(g
            .set_attribute(&id, "name", Some("b".into()), &replay(200))
            .unwrap());
        // An older concurrent write loses.
        assert!(!g
            .set_attribute(&id, "name", Some("c".into()), &replay(150))
            .unwrap());

        let e = g.get(&id).unwrap();
        assert_eq!(e.attribute("name").and_then(|v| v.as_text()), Some("b"));
    }

    #[test]
    fn organic_writes_always_apply() {
        let g = graph();
        let id = SyncId::from("u1");
        g.insert("Item", id.clone(), BTreeMap::new(), &organic(100))
            .unwrap();
        g.set_attribute(&id, "name", Some("b".into()), &organic(200))
            .unwrap();
        // The user edited after seeing "b"; wall clocks can run behind.
        assert!(g
            .set_attribute(&id, "name", Some("c".into()), &organic(150))
            .unwrap());
        let e = g.get(&id).unwrap();
        assert_eq!(e.attribute("name").and_then(|v| v.as_text()), Some("c"));
    }

    #[test]
    fn idempotent_relationship_changes_record_once() {
        let g = graph();
        let owner = SyncId::from("owner");
        let target = SyncId::from("target");
        g.insert("Folder", owner.clone(), BTreeMap::new(), &organic(1))
            .unwrap();
        g.seal_pending(Timestamp::from_millis(1));

        assert!(g
            .add_related(&owner, "items", "Item", target.clone(), &organic(2))
            .unwrap());
        assert!(!g
            .add_related(&owner, "items", "Item", target.clone(), &organic(3))
            .unwrap());

        // Only the membership-changing call recorded a change.
        assert_eq!(g.pending_count(), 1);
    }

    #[test]
    fn deletion_purges_the_id_from_live_relationships() {
        let g = graph();
        let folder = SyncId::from("folder");
        let x = SyncId::from("x");
        g.insert("Folder", folder.clone(), BTreeMap::new(), &organic(1))
            .unwrap();
        g.insert("Item", x.clone(), BTreeMap::new(), &organic(1))
            .unwrap();
        g.add_related(&folder, "tags", "Item", x.clone(), &organic(2))
            .unwrap();

        // The deletion arrives from a peer after the membership was
        // established locally.
        g.delete(&x, &replay(3)).unwrap();

        let f = g.get(&folder).unwrap();
        assert!(!f.is_related("tags", &x));
        assert!(g.is_tombstoned(&x));
    }

    #[test]
    fn relating_to_a_tombstoned_target_fails() {
        let g = graph();
        let folder = SyncId::from("folder");
        let x = SyncId::from("x");
        g.insert("Folder", folder.clone(), BTreeMap::new(), &organic(1))
            .unwrap();
        g.delete(&x, &replay(2)).unwrap();

        let err = g
            .add_related(&folder, "tags", "Item", x.clone(), &organic(3))
            .unwrap_err();
        assert!(matches!(err, GraphError::Tombstoned(_)));
        assert!(!g.get(&folder).unwrap().is_related("tags", &x));
    }

    #[test]
    fn mutating_a_missing_entity_fails() {
        let g = graph();
        let err = g
            .set_attribute(&SyncId::from("nope"), "name", None, &organic(1))
            .unwrap_err();
        assert!(matches!(err, GraphError::NotFound(_)));
    }
}
