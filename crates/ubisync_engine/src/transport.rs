//! Shared-folder transport abstraction.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// A path relative to the shared folder's root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RemotePath(String);

impl RemotePath {
    /// The shared folder's root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Creates a path from its slash-separated string form.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Appends one component.
    #[must_use]
    pub fn join(&self, component: &str) -> Self {
        if self.0.is_empty() {
            Self(component.to_string())
        } else {
            Self(format!("{}/{component}", self.0))
        }
    }

    /// Returns the slash-separated string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePath({})", self.0)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte transport over a shared, eventually-consistent folder.
///
/// The folder is a storage medium, not a coordination primitive: there is
/// no locking across devices, and correctness comes from idempotent,
/// order-based replay, not mutual exclusion. Implementations may block on
/// slow shared-storage metadata; callers must keep these operations off
/// interactive threads.
pub trait FolderTransport: Send + Sync {
    /// Lists the names of entries directly under `path`. A missing
    /// directory lists as empty, since an eventually-consistent folder
    /// cannot distinguish "not yet created" from "not yet visible".
    fn list_dir(&self, path: &RemotePath) -> SyncResult<Vec<String>>;

    /// Reads a whole file.
    fn read_file(&self, path: &RemotePath) -> SyncResult<Vec<u8>>;

    /// Writes a whole file so no reader ever observes a partial write.
    fn write_file_atomic(&self, path: &RemotePath, bytes: &[u8]) -> SyncResult<()>;

    /// Returns true if a file exists at `path`.
    fn exists(&self, path: &RemotePath) -> SyncResult<bool>;

    /// Downloads a remote file to `dest`, atomically: on failure or
    /// cancellation no partial file is visible at `dest`.
    fn copy_to_local(&self, path: &RemotePath, dest: &Path) -> SyncResult<()>;

    /// Uploads a local file to `path` atomically.
    fn copy_from_local(&self, src: &Path, path: &RemotePath) -> SyncResult<()>;
}

/// An in-process folder for tests: a map from path to bytes, shared
/// between any number of simulated devices, with failure injection.
#[derive(Default)]
pub struct MemoryFolder {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_paths_containing: Mutex<Option<String>>,
    hidden_fragment: Mutex<Option<String>>,
}

impl MemoryFolder {
    /// Creates an empty folder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation touching a path that contains `fragment`
    /// fail with a retryable transport error, until cleared.
    pub fn fail_paths_containing(&self, fragment: impl Into<String>) {
        *self.fail_paths_containing.lock() = Some(fragment.into());
    }

    /// Clears failure injection.
    pub fn clear_failures(&self) {
        *self.fail_paths_containing.lock() = None;
    }

    /// Hides every file whose path contains `fragment` from listings and
    /// reads, simulating content an eventually-consistent folder has not
    /// propagated yet.
    pub fn hide_paths_containing(&self, fragment: impl Into<String>) {
        *self.hidden_fragment.lock() = Some(fragment.into());
    }

    /// Makes all hidden files visible again.
    pub fn reveal_all(&self) {
        *self.hidden_fragment.lock() = None;
    }

    /// Returns the number of stored files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    fn is_hidden(&self, path: &str) -> bool {
        self.hidden_fragment
            .lock()
            .as_deref()
            .is_some_and(|fragment| path.contains(fragment))
    }

    fn check_injected(&self, path: &str) -> SyncResult<()> {
        if let Some(fragment) = self.fail_paths_containing.lock().as_deref() {
            if path.contains(fragment) {
                return Err(SyncError::transport_retryable(format!(
                    "injected failure for {path}"
                )));
            }
        }
        Ok(())
    }
}

impl FolderTransport for MemoryFolder {
    fn list_dir(&self, path: &RemotePath) -> SyncResult<Vec<String>> {
        self.check_injected(path.as_str())?;
        let prefix = if path.as_str().is_empty() {
            String::new()
        } else {
            format!("{}/", path.as_str())
        };

        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter(|k| !self.is_hidden(k))
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(idx) => rest[..idx].to_string(),
                None => rest.to_string(),
            })
            .collect();
        names.dedup();
        Ok(names)
    }

    fn read_file(&self, path: &RemotePath) -> SyncResult<Vec<u8>> {
        self.check_injected(path.as_str())?;
        if self.is_hidden(path.as_str()) {
            return Err(SyncError::transport_retryable(format!("not found: {path}")));
        }
        self.files
            .lock()
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| SyncError::transport_retryable(format!("not found: {path}")))
    }

    fn write_file_atomic(&self, path: &RemotePath, bytes: &[u8]) -> SyncResult<()> {
        self.check_injected(path.as_str())?;
        self.files
            .lock()
            .insert(path.as_str().to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, path: &RemotePath) -> SyncResult<bool> {
        self.check_injected(path.as_str())?;
        Ok(self.files.lock().contains_key(path.as_str()))
    }

    fn copy_to_local(&self, path: &RemotePath, dest: &Path) -> SyncResult<()> {
        let bytes = self.read_file(path)?;
        let tmp = dest.with_extension("download");
        std::fs::write(&tmp, &bytes)
            .and_then(|()| std::fs::rename(&tmp, dest))
            .map_err(|e| SyncError::transport_retryable(format!("download to {dest:?}: {e}")))
    }

    fn copy_from_local(&self, src: &Path, path: &RemotePath) -> SyncResult<()> {
        let bytes = std::fs::read(src)
            .map_err(|e| SyncError::transport_retryable(format!("read {src:?}: {e}")))?;
        self.write_file_atomic(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_join() {
        let path = RemotePath::root().join("doc").join("changes");
        assert_eq!(path.as_str(), "doc/changes");
        assert_eq!(RemotePath::root().join("a").as_str(), "a");
    }

    #[test]
    fn write_read_roundtrip() {
        let folder = MemoryFolder::new();
        let path = RemotePath::new("doc/changes/dev/file.cbor");

        folder.write_file_atomic(&path, b"payload").unwrap();
        assert!(folder.exists(&path).unwrap());
        assert_eq!(folder.read_file(&path).unwrap(), b"payload");
    }

    #[test]
    fn missing_directory_lists_empty() {
        let folder = MemoryFolder::new();
        assert!(folder.list_dir(&RemotePath::new("nothing")).unwrap().is_empty());
    }

    #[test]
    fn list_dir_returns_direct_children() {
        let folder = MemoryFolder::new();
        folder
            .write_file_atomic(&RemotePath::new("doc/changes/a/one.cbor"), b"1")
            .unwrap();
        folder
            .write_file_atomic(&RemotePath::new("doc/changes/a/two.cbor"), b"2")
            .unwrap();
        folder
            .write_file_atomic(&RemotePath::new("doc/changes/b/one.cbor"), b"3")
            .unwrap();

        let devices = folder.list_dir(&RemotePath::new("doc/changes")).unwrap();
        assert_eq!(devices, vec!["a", "b"]);

        let files = folder.list_dir(&RemotePath::new("doc/changes/a")).unwrap();
        assert_eq!(files, vec!["one.cbor", "two.cbor"]);
    }

    #[test]
    fn hidden_files_are_invisible_until_revealed() {
        let folder = MemoryFolder::new();
        folder
            .write_file_atomic(&RemotePath::new("doc/changes/a/one.cbor"), b"1")
            .unwrap();
        folder
            .write_file_atomic(&RemotePath::new("doc/changes/b/one.cbor"), b"2")
            .unwrap();

        folder.hide_paths_containing("changes/a");
        assert_eq!(folder.list_dir(&RemotePath::new("doc/changes")).unwrap(), vec!["b"]);
        assert!(folder.read_file(&RemotePath::new("doc/changes/a/one.cbor")).is_err());

        folder.reveal_all();
        assert_eq!(
            folder.list_dir(&RemotePath::new("doc/changes")).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn failure_injection() {
        let folder = MemoryFolder::new();
        let path = RemotePath::new("doc/changes/dev/file.cbor");
        folder.write_file_atomic(&path, b"x").unwrap();

        folder.fail_paths_containing("changes/dev");
        assert!(folder.read_file(&path).is_err());

        folder.clear_failures();
        assert!(folder.read_file(&path).is_ok());
    }
}
