//! Filesystem-backed change-set store.

use crate::error::{SyncError, SyncResult};
use crate::store::ChangeSetStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use ubisync_model::{ChangeSet, DeviceId, Timestamp};

const WATERMARKS_FILE: &str = "watermarks.cbor";
const CHANGESET_PREFIX: &str = "changeset-";
const CHANGESET_SUFFIX: &str = ".cbor";

/// File name of a change set, zero-padded so lexicographic order is
/// timestamp order. The same convention applies locally and in the
/// shared folder.
pub(crate) fn changeset_file_name(timestamp: Timestamp) -> String {
    format!("{CHANGESET_PREFIX}{:013}{CHANGESET_SUFFIX}", timestamp.as_millis())
}

/// Parses a change-set file name back to its timestamp. Returns `None`
/// for files that do not follow the convention.
pub(crate) fn parse_changeset_file_name(name: &str) -> Option<Timestamp> {
    let millis = name
        .strip_prefix(CHANGESET_PREFIX)?
        .strip_suffix(CHANGESET_SUFFIX)?;
    millis.parse().ok().map(Timestamp::from_millis)
}

/// Persisted watermark bookkeeping.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct WatermarkState {
    peers: BTreeMap<DeviceId, Timestamp>,
    last_exported: Option<Timestamp>,
}

/// A change-set store persisted as a directory of CBOR files.
///
/// Layout:
///
/// ```text
/// <dir>/changeset-0000000000100.cbor
/// <dir>/changeset-0000000000250.cbor
/// <dir>/watermarks.cbor
/// ```
///
/// One file per change set, named by zero-padded millisecond timestamp so
/// lexicographic directory order is timestamp order. Watermarks are
/// rewritten via a temp file and atomic rename; a torn watermark file is
/// never visible.
///
/// All persistence failures surface as [`SyncError::Bookkeeping`]: they
/// indicate a local storage defect, not a sync conflict.
pub struct FileChangeSetStore {
    dir: PathBuf,
    sets: RwLock<Vec<ChangeSet>>,
    watermarks: RwLock<WatermarkState>,
}

impl FileChangeSetStore {
    /// Opens or creates a store in `dir`, loading any persisted change
    /// sets and watermarks.
    ///
    /// Files that fail to decode are skipped with a warning rather than
    /// poisoning the whole store.
    ///
    /// # Errors
    ///
    /// [`SyncError::Bookkeeping`] if the directory cannot be created or
    /// listed.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| SyncError::bookkeeping(format!("create {}: {e}", dir.display())))?;

        let mut sets = Vec::new();
        let entries = fs::read_dir(dir)
            .map_err(|e| SyncError::bookkeeping(format!("list {}: {e}", dir.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| SyncError::bookkeeping(format!("list {}: {e}", dir.display())))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(CHANGESET_PREFIX) || !name.ends_with(CHANGESET_SUFFIX) {
                continue;
            }
            let bytes = fs::read(entry.path())
                .map_err(|e| SyncError::bookkeeping(format!("read {name}: {e}")))?;
            match ChangeSet::decode(&bytes) {
                Ok(set) => sets.push(set),
                Err(e) => warn!(file = %name, "skipping undecodable change set: {e}"),
            }
        }
        sets.sort_by_key(|s| s.timestamp);

        let watermarks = Self::load_watermarks(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            sets: RwLock::new(sets),
            watermarks: RwLock::new(watermarks),
        })
    }

    /// The directory this store persists into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_watermarks(dir: &Path) -> SyncResult<WatermarkState> {
        let path = dir.join(WATERMARKS_FILE);
        if !path.exists() {
            return Ok(WatermarkState::default());
        }
        let bytes = fs::read(&path)
            .map_err(|e| SyncError::bookkeeping(format!("read watermarks: {e}")))?;
        ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| SyncError::bookkeeping(format!("decode watermarks: {e}")))
    }

    fn persist_watermarks(&self, state: &WatermarkState) -> SyncResult<()> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(state, &mut bytes)
            .map_err(|e| SyncError::bookkeeping(format!("encode watermarks: {e}")))?;
        write_atomic(&self.dir.join(WATERMARKS_FILE), &bytes)
            .map_err(|e| SyncError::bookkeeping(format!("write watermarks: {e}")))
    }
}

/// Writes `bytes` to `path` via a sibling temp file and rename, so a
/// reader never observes a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

impl ChangeSetStore for FileChangeSetStore {
    fn append(&self, set: &ChangeSet) -> SyncResult<()> {
        let bytes = set
            .encode()
            .map_err(|e| SyncError::bookkeeping(format!("encode change set: {e}")))?;
        let path = self.dir.join(changeset_file_name(set.timestamp));
        write_atomic(&path, &bytes)
            .map_err(|e| SyncError::bookkeeping(format!("write {}: {e}", path.display())))?;

        let mut sets = self.sets.write();
        sets.push(set.clone());
        sets.sort_by_key(|s| s.timestamp);
        Ok(())
    }

    fn all_newer_than(&self, timestamp: Timestamp) -> SyncResult<Vec<ChangeSet>> {
        Ok(self
            .sets
            .read()
            .iter()
            .filter(|s| s.timestamp > timestamp)
            .cloned()
            .collect())
    }

    fn newest(&self) -> SyncResult<Option<ChangeSet>> {
        Ok(self.sets.read().last().cloned())
    }

    fn peer_watermark(&self, peer: &DeviceId) -> SyncResult<Option<Timestamp>> {
        Ok(self.watermarks.read().peers.get(peer).copied())
    }

    fn set_peer_watermark(&self, peer: &DeviceId, timestamp: Timestamp) -> SyncResult<()> {
        let mut state = self.watermarks.write();
        state.peers.insert(peer.clone(), timestamp);
        self.persist_watermarks(&state)
    }

    fn last_exported(&self) -> SyncResult<Option<Timestamp>> {
        Ok(self.watermarks.read().last_exported)
    }

    fn set_last_exported(&self, timestamp: Timestamp) -> SyncResult<()> {
        let mut state = self.watermarks.write();
        state.last_exported = Some(timestamp);
        self.persist_watermarks(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubisync_model::{Change, SyncId};

    fn make_set(ts: u64) -> ChangeSet {
        ChangeSet::seal(
            DeviceId::from("dev"),
            Timestamp::from_millis(ts),
            vec![Change::deletion(
                SyncId::from("u1"),
                "Item",
                Timestamp::from_millis(ts),
            )],
        )
        .unwrap()
    }

    #[test]
    fn append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileChangeSetStore::open(dir.path()).unwrap();
            store.append(&make_set(100)).unwrap();
            store.append(&make_set(200)).unwrap();
            store
                .set_peer_watermark(&DeviceId::from("peer"), Timestamp::from_millis(100))
                .unwrap();
            store.set_last_exported(Timestamp::from_millis(200)).unwrap();
        }

        // A fresh open sees everything the previous instance persisted.
        let store = FileChangeSetStore::open(dir.path()).unwrap();
        let all = store.all_newer_than(Timestamp::ZERO).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp, Timestamp::from_millis(100));
        assert_eq!(
            store.newest().unwrap().unwrap().timestamp,
            Timestamp::from_millis(200)
        );
        assert_eq!(
            store.peer_watermark(&DeviceId::from("peer")).unwrap(),
            Some(Timestamp::from_millis(100))
        );
        assert_eq!(
            store.last_exported().unwrap(),
            Some(Timestamp::from_millis(200))
        );
    }

    #[test]
    fn undecodable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileChangeSetStore::open(dir.path()).unwrap();
            store.append(&make_set(100)).unwrap();
        }
        fs::write(dir.path().join("changeset-0000000000999.cbor"), b"garbage").unwrap();

        let store = FileChangeSetStore::open(dir.path()).unwrap();
        assert_eq!(store.all_newer_than(Timestamp::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn file_names_sort_by_timestamp() {
        assert!(
            changeset_file_name(Timestamp::from_millis(999))
                < changeset_file_name(Timestamp::from_millis(1_000))
        );
    }

    #[test]
    fn file_name_parse_roundtrip() {
        let ts = Timestamp::from_millis(1_234);
        assert_eq!(parse_changeset_file_name(&changeset_file_name(ts)), Some(ts));
        assert_eq!(parse_changeset_file_name("watermarks.cbor"), None);
        assert_eq!(parse_changeset_file_name("changeset-xyz.cbor"), None);
    }

    #[test]
    fn write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.cbor");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
