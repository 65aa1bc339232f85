//! Idempotent replay of foreign change sets.

use crate::error::SyncResult;
use tracing::{debug, warn};
use ubisync_graph::{GraphError, ObjectGraph, WriteContext};
use ubisync_model::{Change, ChangeKind, ChangeSet, SyncId};

/// Why a change was skipped during replay. All skips are non-fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The target's sync ID is tombstoned; the change is permanently
    /// suppressed.
    Tombstoned,
    /// The entity already exists; a duplicate insertion is a no-op.
    DuplicateInsertion,
    /// An insertion for a tombstoned ID. Resurrection is disallowed;
    /// this is a protocol violation, dropped and logged.
    TombstonedInsertion,
    /// The referenced entity never materialized during this set's
    /// replay. Self-heals when the missing change set arrives.
    DanglingReference,
    /// A replayed attribute write older than the attribute's current
    /// stamp; a newer write already won.
    StaleWrite,
}

/// One skipped change and the reason it was skipped.
#[derive(Debug, Clone)]
pub struct SkippedChange {
    /// Sync ID of the entity the change targeted.
    pub object_sync_id: SyncId,
    /// Short name of the change kind.
    pub kind: &'static str,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// The outcome of replaying one change set.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Number of changes that mutated the graph.
    pub applied: usize,
    /// Changes that were skipped, with reasons.
    pub skipped: Vec<SkippedChange>,
}

impl ApplyReport {
    /// Returns true if every change applied.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }

    fn skip(&mut self, change: &Change, reason: SkipReason) {
        self.skipped.push(SkippedChange {
            object_sync_id: change.object_sync_id.clone(),
            kind: change.kind.name(),
            reason,
        });
    }
}

enum Outcome {
    Applied,
    Skipped(SkipReason),
    /// The change's target is not live yet; retry after the rest of the
    /// set has been applied.
    Deferred,
}

/// Replays foreign change sets against the local object graph.
///
/// Replay is idempotent and order-respecting: changes within a set apply
/// in generation order, and a change already reflected in the graph's
/// state is a no-op. Changes whose target has not materialized yet are
/// deferred once to the end of the set (a relationship-add may reference
/// an entity inserted later in the same set only if the producer emitted
/// them out of order; the common case is an entity from a change set
/// that has not arrived at all).
#[derive(Debug, Default)]
pub struct ConflictApplier;

impl ConflictApplier {
    /// Creates an applier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Replays `set` against `graph`.
    ///
    /// # Errors
    ///
    /// A graph storage failure aborts the whole set and propagates; the
    /// caller must not advance the peer's watermark, so the next cycle
    /// retries the set from scratch. Partial prior application is safe
    /// to redo because replay is idempotent.
    pub fn apply<G: ObjectGraph>(&self, set: &ChangeSet, graph: &G) -> SyncResult<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut deferred: Vec<&Change> = Vec::new();

        for change in &set.changes {
            match self.apply_one(change, graph)? {
                Outcome::Applied => report.applied += 1,
                Outcome::Skipped(reason) => report.skip(change, reason),
                Outcome::Deferred => deferred.push(change),
            }
        }

        // Single retry pass: an insertion later in the set may have
        // materialized a deferred change's target.
        for change in deferred {
            match self.apply_one(change, graph)? {
                Outcome::Applied => report.applied += 1,
                Outcome::Skipped(reason) => report.skip(change, reason),
                Outcome::Deferred => {
                    debug!(
                        sync_id = %change.object_sync_id,
                        kind = change.kind.name(),
                        "dropping change with dangling reference; will self-heal"
                    );
                    report.skip(change, SkipReason::DanglingReference);
                }
            }
        }

        Ok(report)
    }

    fn apply_one<G: ObjectGraph>(&self, change: &Change, graph: &G) -> SyncResult<Outcome> {
        let id = &change.object_sync_id;
        let ctx = WriteContext::replay(change.timestamp);

        match &change.kind {
            ChangeKind::Insertion { attributes } => {
                if graph.is_tombstoned(id) {
                    warn!(sync_id = %id, "insertion for a tombstoned ID dropped");
                    return Ok(Outcome::Skipped(SkipReason::TombstonedInsertion));
                }
                if graph.contains(id) {
                    return Ok(Outcome::Skipped(SkipReason::DuplicateInsertion));
                }
                graph.insert(&change.entity_name, id.clone(), attributes.clone(), &ctx)?;
                Ok(Outcome::Applied)
            }

            ChangeKind::Deletion => {
                // Tombstoning is unconditional, so replaying a deletion
                // twice (or before the insertion arrives) stays a no-op.
                graph.delete(id, &ctx)?;
                Ok(Outcome::Applied)
            }

            ChangeKind::AttributeSet { attribute, value } => {
                if graph.is_tombstoned(id) {
                    return Ok(Outcome::Skipped(SkipReason::Tombstoned));
                }
                if !graph.contains(id) {
                    return Ok(Outcome::Deferred);
                }
                match graph.set_attribute(id, attribute, value.clone(), &ctx) {
                    Ok(true) => Ok(Outcome::Applied),
                    Ok(false) => Ok(Outcome::Skipped(SkipReason::StaleWrite)),
                    Err(GraphError::NotFound(_)) => Ok(Outcome::Deferred),
                    Err(GraphError::Tombstoned(_)) => Ok(Outcome::Skipped(SkipReason::Tombstoned)),
                    Err(e) => Err(e.into()),
                }
            }

            ChangeKind::RelationshipAdd {
                relationship,
                target_entity,
                target_id,
            } => {
                if graph.is_tombstoned(id) || graph.is_tombstoned(target_id) {
                    return Ok(Outcome::Skipped(SkipReason::Tombstoned));
                }
                if !graph.contains(id) || !graph.contains(target_id) {
                    return Ok(Outcome::Deferred);
                }
                graph.add_related(id, relationship, target_entity, target_id.clone(), &ctx)?;
                Ok(Outcome::Applied)
            }

            ChangeKind::RelationshipRemove {
                relationship,
                target_entity,
                target_id,
            } => {
                if graph.is_tombstoned(id) {
                    return Ok(Outcome::Skipped(SkipReason::Tombstoned));
                }
                if !graph.contains(id) {
                    return Ok(Outcome::Deferred);
                }
                // A tombstoned target may still be a member; removing it
                // is fine and keeps the relation clean.
                graph.remove_related(id, relationship, target_entity, target_id, &ctx)?;
                Ok(Outcome::Applied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use ubisync_graph::MemoryGraph;
    use ubisync_model::{AttributeValue, DeviceId, Timestamp};

    fn graph() -> MemoryGraph {
        MemoryGraph::new(DeviceId::from("local"))
    }

    fn set_of(device: &str, ts: u64, changes: Vec<Change>) -> ChangeSet {
        ChangeSet::seal(DeviceId::from(device), Timestamp::from_millis(ts), changes).unwrap()
    }

    fn insertion(id: &str, ts: u64, name: &str) -> Change {
        Change::insertion(
            SyncId::from(id),
            "Item",
            Timestamp::from_millis(ts),
            BTreeMap::from([("name".to_string(), AttributeValue::from(name))]),
        )
    }

    fn attr_set(id: &str, ts: u64, value: &str) -> Change {
        Change::attribute_set(
            SyncId::from(id),
            "Item",
            Timestamp::from_millis(ts),
            "name",
            Some(value.into()),
        )
    }

    fn rel_add(owner: &str, ts: u64, target: &str) -> Change {
        Change::new(
            SyncId::from(owner),
            "Folder",
            Timestamp::from_millis(ts),
            ChangeKind::RelationshipAdd {
                relationship: "tags".into(),
                target_entity: "Item".into(),
                target_id: SyncId::from(target),
            },
        )
    }

    #[test]
    fn insertion_materializes_without_defaults() {
        let g = graph();
        g.register_defaults("Item", |attrs| {
            attrs.insert("status".to_string(), "new".into());
        });

        let report = ConflictApplier::new()
            .apply(&set_of("peer", 100, vec![insertion("u1", 100, "a")]), &g)
            .unwrap();

        assert_eq!(report.applied, 1);
        let e = g.get(&SyncId::from("u1")).unwrap();
        assert_eq!(e.attribute("name").and_then(|v| v.as_text()), Some("a"));
        // Defaults are for organic inserts only.
        assert_eq!(e.attribute("status"), None);
        // Replay emitted no secondary changes.
        assert_eq!(ubisync_graph::LocalChangeSource::pending_count(&g), 0);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let g = graph();
        let set = set_of(
            "peer",
            100,
            vec![insertion("u1", 100, "a"), attr_set("u1", 101, "b")],
        );
        let applier = ConflictApplier::new();

        applier.apply(&set, &g).unwrap();
        let first = g.snapshot();

        let report = applier.apply(&set, &g).unwrap();
        assert_eq!(g.snapshot(), first);
        // The duplicate insertion reports as skipped, the attribute write
        // re-applies at an equal stamp.
        assert!(report
            .skipped
            .iter()
            .any(|s| s.reason == SkipReason::DuplicateInsertion));
    }

    #[test]
    fn attribute_set_defers_until_in_set_insertion() {
        let g = graph();
        // Out-of-order producer: the write precedes the insertion.
        let set = set_of(
            "peer",
            100,
            vec![attr_set("u1", 101, "b"), insertion("u1", 100, "a")],
        );

        let report = ConflictApplier::new().apply(&set, &g).unwrap();
        assert_eq!(report.applied, 2);
        let e = g.get(&SyncId::from("u1")).unwrap();
        assert_eq!(e.attribute("name").and_then(|v| v.as_text()), Some("b"));
    }

    #[test]
    fn unresolvable_reference_is_reported_not_fatal() {
        let g = graph();
        let set = set_of("peer", 100, vec![attr_set("ghost", 100, "x")]);

        let report = ConflictApplier::new().apply(&set, &g).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::DanglingReference);
    }

    #[test]
    fn tombstoned_insertion_is_dropped() {
        let g = graph();
        let applier = ConflictApplier::new();

        applier
            .apply(
                &set_of(
                    "peer",
                    100,
                    vec![Change::deletion(
                        SyncId::from("u1"),
                        "Item",
                        Timestamp::from_millis(100),
                    )],
                ),
                &g,
            )
            .unwrap();

        let report = applier
            .apply(&set_of("peer", 200, vec![insertion("u1", 200, "a")]), &g)
            .unwrap();

        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped[0].reason, SkipReason::TombstonedInsertion);
        assert!(!g.contains(&SyncId::from("u1")));
    }

    #[test]
    fn later_write_wins_regardless_of_arrival_order() {
        let g = graph();
        let applier = ConflictApplier::new();

        applier
            .apply(&set_of("a", 100, vec![insertion("u1", 100, "a")]), &g)
            .unwrap();
        applier
            .apply(&set_of("a", 200, vec![attr_set("u1", 200, "b")]), &g)
            .unwrap();

        // The older concurrent write arrives last and loses.
        let report = applier
            .apply(&set_of("b", 150, vec![attr_set("u1", 150, "c")]), &g)
            .unwrap();
        assert_eq!(report.skipped[0].reason, SkipReason::StaleWrite);

        let e = g.get(&SyncId::from("u1")).unwrap();
        assert_eq!(e.attribute("name").and_then(|v| v.as_text()), Some("b"));
    }

    #[test]
    fn relationship_add_to_tombstoned_target_is_suppressed() {
        let g = graph();
        let applier = ConflictApplier::new();

        applier
            .apply(
                &set_of(
                    "a",
                    100,
                    vec![
                        Change::insertion(
                            SyncId::from("folder"),
                            "Folder",
                            Timestamp::from_millis(100),
                            BTreeMap::new(),
                        ),
                        insertion("x", 100, "x"),
                    ],
                ),
                &g,
            )
            .unwrap();

        // Peer b deleted x before seeing the relation; the deletion
        // merges in time order ahead of the add.
        applier
            .apply(
                &set_of(
                    "b",
                    250,
                    vec![Change::deletion(
                        SyncId::from("x"),
                        "Item",
                        Timestamp::from_millis(250),
                    )],
                ),
                &g,
            )
            .unwrap();

        let report = applier
            .apply(&set_of("a", 300, vec![rel_add("folder", 300, "x")]), &g)
            .unwrap();
        assert_eq!(report.skipped[0].reason, SkipReason::Tombstoned);

        let folder = g.get(&SyncId::from("folder")).unwrap();
        assert!(!folder.is_related("tags", &SyncId::from("x")));
    }

    #[test]
    fn deletion_before_insertion_still_tombstones() {
        let g = graph();
        let applier = ConflictApplier::new();

        applier
            .apply(
                &set_of(
                    "b",
                    100,
                    vec![Change::deletion(
                        SyncId::from("u1"),
                        "Item",
                        Timestamp::from_millis(100),
                    )],
                ),
                &g,
            )
            .unwrap();

        assert!(g.is_tombstoned(&SyncId::from("u1")));
    }

    #[test]
    fn relationship_changes_commute_with_replays() {
        let g = graph();
        let applier = ConflictApplier::new();

        applier
            .apply(
                &set_of(
                    "a",
                    100,
                    vec![
                        Change::insertion(
                            SyncId::from("folder"),
                            "Folder",
                            Timestamp::from_millis(100),
                            BTreeMap::new(),
                        ),
                        insertion("x", 100, "x"),
                        rel_add("folder", 101, "x"),
                    ],
                ),
                &g,
            )
            .unwrap();

        // Re-adding is a no-op, not an error.
        let report = applier
            .apply(&set_of("a", 200, vec![rel_add("folder", 200, "x")]), &g)
            .unwrap();
        assert_eq!(report.applied, 1);

        let folder = g.get(&SyncId::from("folder")).unwrap();
        assert_eq!(folder.related("tags").unwrap().len(), 1);
    }
}
