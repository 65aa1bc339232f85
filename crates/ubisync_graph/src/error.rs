//! Error types for graph operations.

use thiserror::Error;
use ubisync_model::SyncId;

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur while mutating the object graph.
#[derive(Error, Debug)]
pub enum GraphError {
    /// No live entity carries the given sync ID.
    #[error("no entity with sync ID {0}")]
    NotFound(SyncId),

    /// An insertion reused a sync ID that already identifies a live entity.
    #[error("sync ID {0} already identifies a live entity")]
    DuplicateId(SyncId),

    /// The sync ID was deleted earlier; resurrection is disallowed.
    #[error("sync ID {0} is tombstoned")]
    Tombstoned(SyncId),

    /// The entity exists under a different entity name than expected.
    #[error("entity {sync_id} is a {actual}, expected {expected}")]
    EntityKindMismatch {
        /// Sync ID of the entity.
        sync_id: SyncId,
        /// Entity name the caller expected.
        expected: String,
        /// Entity name actually stored.
        actual: String,
    },

    /// The underlying store failed to persist the mutation.
    #[error("graph storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GraphError::Tombstoned(SyncId::from("u1"));
        assert_eq!(err.to_string(), "sync ID u1 is tombstoned");

        let err = GraphError::EntityKindMismatch {
            sync_id: SyncId::from("u2"),
            expected: "Item".into(),
            actual: "Folder".into(),
        };
        assert!(err.to_string().contains("expected Item"));
    }
}
