//! Error types for the sync engine.

use thiserror::Error;
use ubisync_model::DocumentId;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// The taxonomy matters for propagation:
/// - transport errors are usually retryable; the cycle aborts and resumes
///   from the last good watermark on the next trigger
/// - replay errors are non-fatal and largely self-healing
/// - bookkeeping failures are fatal to the cycle: they indicate a local
///   storage defect, not a sync conflict
#[derive(Error, Debug)]
pub enum SyncError {
    /// Shared-folder transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Encoding or decoding of a transported record failed.
    #[error("codec error: {0}")]
    Codec(#[from] ubisync_model::ModelError),

    /// The local object graph rejected a mutation.
    #[error("graph error: {0}")]
    Graph(#[from] ubisync_graph::GraphError),

    /// Local sync bookkeeping (change-set or watermark persistence)
    /// failed. Fatal to the cycle.
    #[error("bookkeeping failure: {0}")]
    Bookkeeping(String),

    /// A peer produced a record that violates the protocol (for example
    /// an insertion for a tombstoned ID). Dropped and logged, non-fatal.
    #[error("protocol violation: {0}")]
    Violation(String),

    /// The cycle was cancelled between stages.
    #[error("sync cancelled")]
    Cancelled,

    /// A sync cycle is already in flight for this document.
    #[error("sync cycle already in progress")]
    CycleInProgress,

    /// No peer has uploaded a whole store for this document yet.
    #[error("no whole-store upload available for document {0}")]
    NoWholeStore(DocumentId),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a bookkeeping failure from an I/O error.
    pub fn bookkeeping(message: impl Into<String>) -> Self {
        Self::Bookkeeping(message.into())
    }

    /// Returns true if this error can be retried on a later cycle.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::CycleInProgress => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a local defect rather than a
    /// sync conflict.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Bookkeeping(_))
    }
}

/// Classifies an I/O error as a transport error.
///
/// Permission problems are not retryable; everything else (unreachable
/// folder, missing file, transient I/O) is.
pub(crate) fn io_to_transport(err: &std::io::Error, what: &str) -> SyncError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            SyncError::transport_fatal(format!("{what}: {err}"))
        }
        _ => SyncError::transport_retryable(format!("{what}: {err}")),
    }
}
