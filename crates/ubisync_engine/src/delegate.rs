//! Host application callbacks.

use crate::coordinator::SyncCycleReport;
use crate::error::SyncError;
use ubisync_model::DocumentId;

/// Callbacks the host application receives about synchronization.
///
/// All methods have no-op defaults; implement only what the application
/// surfaces. [`bookkeeping_failure`](Self::bookkeeping_failure) is kept
/// separate from [`non_fatal_error`](Self::non_fatal_error) because it
/// points to a local storage defect rather than an ordinary sync hiccup,
/// and the user should probably hear about it.
pub trait SyncDelegate: Send + Sync {
    /// A document not seen before appeared in the shared folder. It may
    /// not be downloaded yet.
    fn document_discovered(&self, _document: &DocumentId) {}

    /// A non-fatal error occurred during a cycle; the cycle continued or
    /// will resume on the next trigger.
    fn non_fatal_error(&self, _error: &SyncError) {}

    /// A sync cycle ran to completion; the report carries counts and any
    /// collected non-fatal errors.
    fn cycle_finished(&self, _report: &SyncCycleReport) {}

    /// Local persistence of sync bookkeeping failed. Fatal to the cycle.
    fn bookkeeping_failure(&self, _error: &SyncError) {}
}

/// A delegate that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl SyncDelegate for NoopDelegate {}
