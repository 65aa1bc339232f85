//! Graph traits and write contexts.

use crate::entity::SyncedEntity;
use crate::error::GraphResult;
use std::collections::BTreeMap;
use ubisync_model::{AttributeValue, ChangeSet, SyncId, Timestamp};

/// Who is performing a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A user edit. Records a change for later transport and, on insert,
    /// applies any registered default values.
    Organic,
    /// The sync engine replaying a remote change. Never records a change
    /// (no re-emission) and never applies defaults, since the replayed
    /// snapshot carries every value anyway.
    Replay,
}

/// The context a mutation is performed under.
///
/// Passing the mode explicitly into every mutation replaces the mutable
/// `is_applying_change` / `is_engine_created` entity flags the design
/// grew out of; there is no flag to forget to reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteContext {
    /// Organic or replay.
    pub origin: WriteOrigin,
    /// The timestamp the write is stamped with. Organic writes use the
    /// current wall clock; replay writes carry the remote change's time.
    pub timestamp: Timestamp,
}

impl WriteContext {
    /// An organic write stamped with the current wall clock.
    #[must_use]
    pub fn organic() -> Self {
        Self {
            origin: WriteOrigin::Organic,
            timestamp: Timestamp::now(),
        }
    }

    /// An organic write with an explicit timestamp (deterministic tests).
    #[must_use]
    pub fn organic_at(timestamp: Timestamp) -> Self {
        Self {
            origin: WriteOrigin::Organic,
            timestamp,
        }
    }

    /// A replay write carrying the remote change's timestamp.
    #[must_use]
    pub fn replay(timestamp: Timestamp) -> Self {
        Self {
            origin: WriteOrigin::Replay,
            timestamp,
        }
    }

    /// Returns true for replay contexts.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.origin == WriteOrigin::Replay
    }
}

/// The seam the sync engine reads and mutates entities through.
///
/// Implementations must serialize mutations with the host persistence
/// layer's own commit discipline; replay runs in its own transaction
/// scope, distinct from interactive edits.
pub trait ObjectGraph: Send + Sync {
    /// Inserts a new entity with the given attribute snapshot.
    ///
    /// # Errors
    ///
    /// - [`crate::GraphError::DuplicateId`] if the sync ID already
    ///   identifies a live entity
    /// - [`crate::GraphError::EntityKindMismatch`] if it identifies a
    ///   live entity of a different entity name
    /// - [`crate::GraphError::Tombstoned`] if the sync ID was deleted
    ///   earlier (resurrection is disallowed)
    fn insert(
        &self,
        entity_name: &str,
        sync_id: SyncId,
        attributes: BTreeMap<String, AttributeValue>,
        ctx: &WriteContext,
    ) -> GraphResult<()>;

    /// Deletes an entity and tombstones its sync ID.
    ///
    /// Tombstoning happens even if no live entity carries the ID, so a
    /// late-arriving deletion still suppresses later stale changes. The
    /// dead ID is also dropped from every live entity's relationship
    /// sets, so a membership added before the deletion was seen does not
    /// outlive its target.
    fn delete(&self, sync_id: &SyncId, ctx: &WriteContext) -> GraphResult<()>;

    /// Overwrites one scalar attribute (`None` clears it).
    ///
    /// Returns true if the write was applied, false if it was suppressed
    /// as stale (a replay write older than the attribute's current stamp).
    ///
    /// # Errors
    ///
    /// [`crate::GraphError::NotFound`] if no live entity carries the ID.
    fn set_attribute(
        &self,
        sync_id: &SyncId,
        attribute: &str,
        value: Option<AttributeValue>,
        ctx: &WriteContext,
    ) -> GraphResult<bool>;

    /// Adds a target to a to-many relationship. Returns true if
    /// membership changed.
    ///
    /// # Errors
    ///
    /// [`crate::GraphError::NotFound`] if the owner is not live, or
    /// [`crate::GraphError::Tombstoned`] if either side is tombstoned.
    fn add_related(
        &self,
        sync_id: &SyncId,
        relationship: &str,
        target_entity: &str,
        target_id: SyncId,
        ctx: &WriteContext,
    ) -> GraphResult<bool>;

    /// Removes a target from a to-many relationship. Returns true if
    /// membership changed.
    ///
    /// # Errors
    ///
    /// [`crate::GraphError::NotFound`] if the owner is not live.
    fn remove_related(
        &self,
        sync_id: &SyncId,
        relationship: &str,
        target_entity: &str,
        target_id: &SyncId,
        ctx: &WriteContext,
    ) -> GraphResult<bool>;

    /// Returns a copy of the entity, if live.
    fn get(&self, sync_id: &SyncId) -> Option<SyncedEntity>;

    /// Returns true if a live entity carries the sync ID.
    fn contains(&self, sync_id: &SyncId) -> bool;

    /// Returns true if the sync ID was deleted earlier.
    fn is_tombstoned(&self, sync_id: &SyncId) -> bool;

    /// Returns the sync IDs of all live entities.
    fn entity_ids(&self) -> Vec<SyncId>;
}

/// The commit-time batching seam.
///
/// The host persistence layer calls [`seal_pending`](Self::seal_pending)
/// once per local commit; the returned change set is the unit of
/// transport and replay.
pub trait LocalChangeSource: Send + Sync {
    /// Seals every change recorded since the previous seal into one
    /// change set, or returns `None` if the commit produced no changes.
    ///
    /// Sealed timestamps are strictly monotonic per device, so one
    /// device's change sets totally order even within a millisecond.
    fn seal_pending(&self, commit_time: Timestamp) -> Option<ChangeSet>;

    /// Returns the number of changes recorded and not yet sealed.
    fn pending_count(&self) -> usize;
}
