//! The per-document sync coordinator.

use crate::applier::{ConflictApplier, SkipReason, SkippedChange};
use crate::config::SyncConfig;
use crate::delegate::SyncDelegate;
use crate::error::{SyncError, SyncResult};
use crate::file_store::{changeset_file_name, parse_changeset_file_name};
use crate::registry::DeviceRegistry;
use crate::store::ChangeSetStore;
use crate::transport::FolderTransport;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ubisync_graph::{LocalChangeSource, ObjectGraph};
use ubisync_model::{
    sort_for_replay, ChangeSet, DeviceId, StoreManifest, Timestamp,
};

/// The phase a coordinator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No cycle in flight.
    Idle,
    /// Enumerating peer devices in the shared folder.
    Discovering,
    /// Fetching unseen change sets from peers.
    Pulling,
    /// Replaying pulled change sets into the local graph.
    Applying,
    /// Exporting local change sets to the shared folder.
    Pushing,
    /// The last cycle aborted; a new one may start.
    Failed,
}

impl SyncPhase {
    /// Returns true if a cycle is in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncPhase::Discovering | SyncPhase::Pulling | SyncPhase::Applying | SyncPhase::Pushing
        )
    }

    /// Returns true if a new cycle may start.
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(self, SyncPhase::Idle | SyncPhase::Failed)
    }
}

/// Counters across the coordinator's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ran to completion.
    pub cycles_completed: u64,
    /// Change sets pulled from peers.
    pub sets_pulled: u64,
    /// Change sets fully applied.
    pub sets_applied: u64,
    /// Change sets exported to the shared folder.
    pub sets_pushed: u64,
    /// Individual changes skipped during replay.
    pub changes_skipped: u64,
    /// Message of the last cycle-aborting error.
    pub last_error: Option<String>,
}

/// The outcome of one sync cycle.
#[derive(Debug, Default)]
pub struct SyncCycleReport {
    /// Change sets pulled from peers.
    pub pulled: usize,
    /// Change sets fully applied.
    pub applied: usize,
    /// Change sets exported.
    pub pushed: usize,
    /// Changes skipped during replay, with reasons.
    pub skipped: Vec<SkippedChange>,
    /// Non-fatal per-change-set errors collected during the cycle.
    pub errors: Vec<SyncError>,
    /// True if the cycle ran to completion. Collected non-fatal errors
    /// do not clear this flag; an aborted cycle never produces a report.
    pub success: bool,
    /// Wall time the cycle took.
    pub duration: Duration,
}

/// Orchestrates one document's synchronization cycle.
///
/// Collaborators are injected at construction: the folder transport, the
/// local object graph, the change-set store and the delegate. The
/// coordinator never reaches for ambient state.
///
/// A cycle walks `Idle → Discovering → Pulling → Applying → Pushing →
/// Idle`, or `Failed` when a stage aborts. At most one cycle per
/// coordinator runs at a time; a second `sync` while one is in flight is
/// rejected with [`SyncError::CycleInProgress`]. Cancellation takes
/// effect between stages and between change sets, never mid-set.
pub struct SyncCoordinator<T, G, S>
where
    T: FolderTransport,
    G: ObjectGraph + LocalChangeSource,
    S: ChangeSetStore,
{
    config: SyncConfig,
    transport: Arc<T>,
    graph: Arc<G>,
    store: Arc<S>,
    registry: DeviceRegistry<T>,
    applier: ConflictApplier,
    delegate: Arc<dyn SyncDelegate>,
    phase: RwLock<SyncPhase>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<T, G, S> SyncCoordinator<T, G, S>
where
    T: FolderTransport,
    G: ObjectGraph + LocalChangeSource,
    S: ChangeSetStore,
{
    /// Creates a coordinator for the configured document and device.
    pub fn new(
        config: SyncConfig,
        transport: Arc<T>,
        graph: Arc<G>,
        store: Arc<S>,
        delegate: Arc<dyn SyncDelegate>,
    ) -> Self {
        let registry = DeviceRegistry::new(transport.clone());
        Self {
            config,
            transport,
            graph,
            store,
            registry,
            applier: ConflictApplier::new(),
            delegate,
            phase: RwLock::new(SyncPhase::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    /// A copy of the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The registry this coordinator discovers peers through.
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry<T> {
        &self.registry
    }

    /// Requests cancellation of the in-flight cycle. Takes effect at the
    /// next stage or change-set boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
    }

    /// Seals any changes pending from the current local commit and
    /// persists them to the change-set store.
    ///
    /// The host calls this once per committed transaction. Returns the
    /// sealed set's timestamp, or `None` if the commit produced no
    /// changes.
    ///
    /// # Errors
    ///
    /// A store failure is surfaced through
    /// [`SyncDelegate::bookkeeping_failure`] and propagated; the host
    /// must treat the commit's sync bookkeeping as unsaved.
    pub fn commit_local(&self, commit_time: Timestamp) -> SyncResult<Option<Timestamp>> {
        self.seal_and_store(commit_time).inspect_err(|e| {
            self.delegate.bookkeeping_failure(e);
        })
    }

    fn seal_and_store(&self, commit_time: Timestamp) -> SyncResult<Option<Timestamp>> {
        let Some(set) = self.graph.seal_pending(commit_time) else {
            return Ok(None);
        };
        let timestamp = set.timestamp;
        self.store.append(&set)?;
        debug!(timestamp = %timestamp, changes = set.changes.len(), "sealed local change set");
        Ok(Some(timestamp))
    }

    /// Runs one synchronization cycle.
    ///
    /// # Errors
    ///
    /// - [`SyncError::CycleInProgress`] if a cycle is already in flight
    /// - transport errors abort the cycle; the next one resumes from the
    ///   last good watermarks
    /// - [`SyncError::Bookkeeping`] aborts the cycle and is also
    ///   surfaced through the delegate
    pub fn sync(&self) -> SyncResult<SyncCycleReport> {
        {
            let mut phase = self.phase.write();
            if !phase.can_start() {
                return Err(SyncError::CycleInProgress);
            }
            *phase = SyncPhase::Discovering;
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let start = Instant::now();
        match self.run_cycle() {
            Ok(mut report) => {
                report.success = true;
                report.duration = start.elapsed();
                self.set_phase(SyncPhase::Idle);

                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.sets_pulled += report.pulled as u64;
                stats.sets_applied += report.applied as u64;
                stats.sets_pushed += report.pushed as u64;
                stats.changes_skipped += report.skipped.len() as u64;
                stats.last_error = None;
                drop(stats);

                info!(
                    pulled = report.pulled,
                    applied = report.applied,
                    pushed = report.pushed,
                    "sync cycle finished"
                );
                self.delegate.cycle_finished(&report);
                Ok(report)
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                self.stats.write().last_error = Some(e.to_string());
                if e.is_fatal() {
                    self.delegate.bookkeeping_failure(&e);
                } else if !matches!(e, SyncError::Cancelled) {
                    self.delegate.non_fatal_error(&e);
                }
                warn!("sync cycle aborted: {e}");
                Err(e)
            }
        }
    }

    fn run_cycle(&self) -> SyncResult<SyncCycleReport> {
        let mut report = SyncCycleReport::default();

        // Discovering
        let peers: Vec<DeviceId> = self
            .registry
            .devices(&self.config.document_id)?
            .into_iter()
            .filter(|d| d != &self.config.device_id)
            .collect();
        debug!(peers = peers.len(), "discovered peer devices");
        self.check_cancelled()?;

        // Pulling
        self.set_phase(SyncPhase::Pulling);
        let mut pulled = self.pull(&peers, &mut report)?;
        report.pulled = pulled.len();
        self.check_cancelled()?;

        // Applying: one merged, globally ordered pass across all peers.
        self.set_phase(SyncPhase::Applying);
        sort_for_replay(&mut pulled);
        self.apply(pulled, &mut report)?;
        self.check_cancelled()?;

        // Pushing
        self.set_phase(SyncPhase::Pushing);
        self.push(&mut report)?;

        Ok(report)
    }

    fn pull(
        &self,
        peers: &[DeviceId],
        report: &mut SyncCycleReport,
    ) -> SyncResult<Vec<ChangeSet>> {
        let mut pulled = Vec::new();
        for peer in peers {
            let watermark = self
                .store
                .peer_watermark(peer)?
                .unwrap_or(Timestamp::ZERO);
            let dir = self.registry.changeset_dir(&self.config.document_id, peer);

            for name in self.transport.list_dir(&dir)? {
                let Some(timestamp) = parse_changeset_file_name(&name) else {
                    continue;
                };
                if timestamp <= watermark {
                    continue;
                }
                let bytes = self.transport.read_file(&dir.join(&name))?;
                match ChangeSet::decode(&bytes) {
                    Ok(set) => pulled.push(set),
                    Err(e) => {
                        // A malformed payload never blocks the cycle.
                        let violation = SyncError::Violation(format!(
                            "undecodable change set {name} from {peer}: {e}"
                        ));
                        warn!("{violation}");
                        self.delegate.non_fatal_error(&violation);
                        report.errors.push(violation);
                    }
                }
            }
        }
        Ok(pulled)
    }

    fn apply(&self, sets: Vec<ChangeSet>, report: &mut SyncCycleReport) -> SyncResult<()> {
        // Once a peer's set fails, its later sets are held back so the
        // watermark resumes from the exact failing point next cycle.
        let mut held_back: HashSet<DeviceId> = HashSet::new();

        for set in sets {
            self.check_cancelled()?;
            if held_back.contains(&set.device_id) {
                continue;
            }

            match self.applier.apply(&set, self.graph.as_ref()) {
                Ok(apply_report) => {
                    // Dangling references heal when the change set that
                    // inserts the target arrives, but only if this set is
                    // replayed again. Leave the watermark so the next
                    // cycle retries it; every other skip is permanent.
                    let dangling = apply_report
                        .skipped
                        .iter()
                        .any(|s| s.reason == SkipReason::DanglingReference);
                    report.skipped.extend(apply_report.skipped);
                    if dangling {
                        debug!(
                            peer = %set.device_id,
                            timestamp = %set.timestamp,
                            "holding watermark for retry of dangling references"
                        );
                        held_back.insert(set.device_id.clone());
                    } else {
                        self.store.set_peer_watermark(&set.device_id, set.timestamp)?;
                        report.applied += 1;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        peer = %set.device_id,
                        timestamp = %set.timestamp,
                        "change set failed to apply: {e}"
                    );
                    self.delegate.non_fatal_error(&e);
                    report.errors.push(e);
                    held_back.insert(set.device_id.clone());
                }
            }
        }
        Ok(())
    }

    fn push(&self, report: &mut SyncCycleReport) -> SyncResult<()> {
        // Drain anything a host commit left unsealed.
        self.seal_and_store(Timestamp::now())?;

        let exported_up_to = self.store.last_exported()?.unwrap_or(Timestamp::ZERO);
        let dir = self
            .registry
            .changeset_dir(&self.config.document_id, &self.config.device_id);

        for set in self.store.all_newer_than(exported_up_to)? {
            let path = dir.join(&changeset_file_name(set.timestamp));
            self.transport.write_file_atomic(&path, &set.encode()?)?;
            self.store.set_last_exported(set.timestamp)?;
            report.pushed += 1;
        }
        Ok(())
    }

    /// Returns true if this device has no local copy of the document and
    /// must bootstrap via a whole-store transfer before incremental sync.
    pub fn needs_bootstrap(&self) -> SyncResult<bool> {
        Ok(self.store.newest()?.is_none() && self.graph.entity_ids().is_empty())
    }

    /// Downloads the newest whole-store upload across all peers to
    /// `dest`.
    ///
    /// The download lands in a temp file and is renamed into place, so a
    /// cancelled or failed transfer leaves no partial file at `dest`.
    /// Blocking; keep off interactive threads.
    ///
    /// # Errors
    ///
    /// [`SyncError::NoWholeStore`] if no peer has uploaded the document.
    pub fn download_whole_store(&self, dest: &Path) -> SyncResult<DeviceId> {
        let manifest = self.registry.newest_whole_store(&self.config.document_id)?;
        let path = self
            .registry
            .wholestore_dir(&self.config.document_id, &manifest.device_id)
            .join(&manifest.file_name);
        info!(
            from = %manifest.device_id,
            uploaded_at = %manifest.uploaded_at,
            "downloading whole store"
        );
        self.transport.copy_to_local(&path, dest)?;
        Ok(manifest.device_id)
    }

    /// Uploads the whole document file at `src`, then publishes a fresh
    /// manifest. The manifest goes second so a peer never sees a
    /// manifest describing a payload that is not there yet.
    pub fn upload_whole_store(&self, src: &Path) -> SyncResult<()> {
        let dir = self
            .registry
            .wholestore_dir(&self.config.document_id, &self.config.device_id);
        let payload_path = dir.join(&self.config.whole_store_file_name);
        self.transport.copy_from_local(src, &payload_path)?;

        let manifest = StoreManifest::new(
            self.config.device_id.clone(),
            Timestamp::now(),
            self.config.whole_store_file_name.clone(),
        );
        let manifest_path = self
            .registry
            .manifest_path(&self.config.document_id, &self.config.device_id);
        self.transport
            .write_file_atomic(&manifest_path, &manifest.encode()?)?;
        info!(uploaded_at = %manifest.uploaded_at, "uploaded whole store");
        Ok(())
    }

    /// Scans the shared folder for documents not seen before and reports
    /// each new one to the delegate.
    pub fn discover_documents(&self) -> SyncResult<()> {
        for document in self.registry.discover_new_documents()? {
            self.delegate.document_discovered(&document);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NoopDelegate;
    use crate::store::MemoryChangeSetStore;
    use crate::transport::MemoryFolder;
    use std::collections::BTreeMap;
    use ubisync_graph::{MemoryGraph, WriteContext};
    use ubisync_model::{DocumentId, SyncId};

    type TestCoordinator = SyncCoordinator<MemoryFolder, MemoryGraph, MemoryChangeSetStore>;

    fn coordinator(folder: &Arc<MemoryFolder>, device: &str) -> (TestCoordinator, Arc<MemoryGraph>) {
        let graph = Arc::new(MemoryGraph::new(DeviceId::from(device)));
        let store = Arc::new(MemoryChangeSetStore::new());
        let coordinator = SyncCoordinator::new(
            SyncConfig::new(DocumentId::from("doc"), DeviceId::from(device)),
            folder.clone(),
            graph.clone(),
            store,
            Arc::new(NoopDelegate),
        );
        (coordinator, graph)
    }

    #[test]
    fn phase_checks() {
        assert!(SyncPhase::Idle.can_start());
        assert!(SyncPhase::Failed.can_start());
        assert!(!SyncPhase::Pulling.can_start());
        assert!(SyncPhase::Applying.is_active());
        assert!(!SyncPhase::Idle.is_active());
    }

    #[test]
    fn empty_folder_cycle_succeeds() {
        let folder = Arc::new(MemoryFolder::new());
        let (coordinator, _) = coordinator(&folder, "dev-a");

        let report = coordinator.sync().unwrap();
        assert!(report.success);
        assert_eq!(report.pulled, 0);
        assert_eq!(coordinator.phase(), SyncPhase::Idle);
        assert_eq!(coordinator.stats().cycles_completed, 1);
    }

    #[test]
    fn commit_local_seals_and_stores() {
        let folder = Arc::new(MemoryFolder::new());
        let (coordinator, graph) = coordinator(&folder, "dev-a");

        graph
            .insert(
                "Item",
                SyncId::from("u1"),
                BTreeMap::new(),
                &WriteContext::organic_at(Timestamp::from_millis(100)),
            )
            .unwrap();

        let sealed = coordinator
            .commit_local(Timestamp::from_millis(100))
            .unwrap();
        assert_eq!(sealed, Some(Timestamp::from_millis(100)));

        // Nothing pending: a second commit seals nothing.
        assert!(coordinator
            .commit_local(Timestamp::from_millis(101))
            .unwrap()
            .is_none());
    }

    #[test]
    fn push_exports_each_set_once() {
        let folder = Arc::new(MemoryFolder::new());
        let (coordinator, graph) = coordinator(&folder, "dev-a");

        graph
            .insert(
                "Item",
                SyncId::from("u1"),
                BTreeMap::new(),
                &WriteContext::organic_at(Timestamp::from_millis(100)),
            )
            .unwrap();
        coordinator.commit_local(Timestamp::from_millis(100)).unwrap();

        let report = coordinator.sync().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(folder.file_count(), 1);

        // Already exported; a second cycle pushes nothing.
        let report = coordinator.sync().unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(folder.file_count(), 1);
    }

    #[test]
    fn transport_failure_aborts_and_marks_failed() {
        let folder = Arc::new(MemoryFolder::new());
        let (producer, graph) = coordinator(&folder, "dev-a");
        graph
            .insert(
                "Item",
                SyncId::from("u1"),
                BTreeMap::new(),
                &WriteContext::organic_at(Timestamp::from_millis(100)),
            )
            .unwrap();
        producer.commit_local(Timestamp::from_millis(100)).unwrap();
        producer.sync().unwrap();

        let (consumer, _) = coordinator(&folder, "dev-b");
        folder.fail_paths_containing("changes/dev-a");

        let err = consumer.sync().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(consumer.phase(), SyncPhase::Failed);

        // The failed phase does not wedge the coordinator.
        folder.clear_failures();
        let report = consumer.sync().unwrap();
        assert_eq!(report.pulled, 1);
    }

    #[test]
    fn cancelled_cycle_reports_cancelled() {
        let folder = Arc::new(MemoryFolder::new());
        let (coordinator, _) = coordinator(&folder, "dev-a");

        // Cancel raced in before the cycle starts its first boundary
        // check; sync resets the flag, so this must complete.
        coordinator.cancel();
        assert!(coordinator.sync().is_ok());
    }

    #[test]
    fn needs_bootstrap_only_when_empty() {
        let folder = Arc::new(MemoryFolder::new());
        let (coordinator, graph) = coordinator(&folder, "dev-a");
        assert!(coordinator.needs_bootstrap().unwrap());

        graph
            .insert(
                "Item",
                SyncId::from("u1"),
                BTreeMap::new(),
                &WriteContext::organic_at(Timestamp::from_millis(100)),
            )
            .unwrap();
        assert!(!coordinator.needs_bootstrap().unwrap());
    }

    #[test]
    fn whole_store_roundtrip() {
        let folder = Arc::new(MemoryFolder::new());
        let (uploader, _) = coordinator(&folder, "dev-a");
        let (downloader, _) = coordinator(&folder, "dev-b");

        let local = tempfile::tempdir().unwrap();
        let src = local.path().join("src.bin");
        std::fs::write(&src, b"the document").unwrap();
        uploader.upload_whole_store(&src).unwrap();

        let dest = local.path().join("dest.bin");
        let from = downloader.download_whole_store(&dest).unwrap();
        assert_eq!(from, DeviceId::from("dev-a"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"the document");
    }

    #[test]
    fn download_without_uploads_fails() {
        let folder = Arc::new(MemoryFolder::new());
        let (coordinator, _) = coordinator(&folder, "dev-a");
        let local = tempfile::tempdir().unwrap();

        let err = coordinator
            .download_whole_store(&local.path().join("dest.bin"))
            .unwrap_err();
        assert!(matches!(err, SyncError::NoWholeStore(_)));
    }
}
