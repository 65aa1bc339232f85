//! Change recording and commit-time batching.

use parking_lot::Mutex;
use ubisync_model::{Change, ChangeSet, DeviceId, Timestamp};

/// Records the changes of the current commit and seals them into change
/// sets.
///
/// The recorder is the change-set batcher: every organic mutation queues
/// one change, and `seal` turns the queue into an immutable change set
/// carrying the changes in generation order.
///
/// # Invariants
///
/// - Sealing an empty queue yields no change set
/// - Sealed timestamps are strictly monotonic for this device
pub struct ChangeRecorder {
    device_id: DeviceId,
    pending: Mutex<Vec<Change>>,
    last_sealed: Mutex<Timestamp>,
}

impl ChangeRecorder {
    /// Creates a recorder for the given device.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            pending: Mutex::new(Vec::new()),
            last_sealed: Mutex::new(Timestamp::ZERO),
        }
    }

    /// The device this recorder records for.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Queues a change for the current commit.
    pub fn record(&self, change: Change) {
        self.pending.lock().push(change);
    }

    /// Returns the number of queued changes.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Seals the queued changes into a change set, or returns `None` if
    /// the queue is empty.
    ///
    /// The set's timestamp is `commit_time`, bumped forward if needed so
    /// it is strictly greater than the previously sealed timestamp.
    pub fn seal(&self, commit_time: Timestamp) -> Option<ChangeSet> {
        let changes = std::mem::take(&mut *self.pending.lock());
        if changes.is_empty() {
            return None;
        }

        let mut last = self.last_sealed.lock();
        let timestamp = if commit_time > *last {
            commit_time
        } else {
            last.next()
        };
        *last = timestamp;

        // seal cannot fail here: the queue was checked non-empty above.
        ChangeSet::seal(self.device_id.clone(), timestamp, changes).ok()
    }

    /// Discards any queued changes (a rolled-back commit).
    pub fn discard_pending(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubisync_model::SyncId;

    fn recorder() -> ChangeRecorder {
        ChangeRecorder::new(DeviceId::from("dev-a"))
    }

    fn change(ts: u64) -> Change {
        Change::deletion(SyncId::from("u1"), "Item", Timestamp::from_millis(ts))
    }

    #[test]
    fn seal_empty_yields_none() {
        assert!(recorder().seal(Timestamp::from_millis(1)).is_none());
    }

    #[test]
    fn seal_preserves_generation_order() {
        let r = recorder();
        r.record(change(1));
        r.record(change(2));
        r.record(change(3));

        let set = r.seal(Timestamp::from_millis(10)).unwrap();
        assert_eq!(set.changes.len(), 3);
        let stamps: Vec<u64> = set.changes.iter().map(|c| c.timestamp.as_millis()).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn sealed_timestamps_are_strictly_monotonic() {
        let r = recorder();

        r.record(change(1));
        let first = r.seal(Timestamp::from_millis(100)).unwrap();

        // Same commit time again: the seal time must move forward.
        r.record(change(2));
        let second = r.seal(Timestamp::from_millis(100)).unwrap();

        assert_eq!(first.timestamp, Timestamp::from_millis(100));
        assert_eq!(second.timestamp, Timestamp::from_millis(101));
    }

    #[test]
    fn discard_pending() {
        let r = recorder();
        r.record(change(1));
        r.discard_pending();
        assert_eq!(r.pending_count(), 0);
        assert!(r.seal(Timestamp::from_millis(1)).is_none());
    }
}
