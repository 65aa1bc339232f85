//! Filesystem-backed shared folder.

use crate::error::{io_to_transport, SyncResult};
use crate::file_store::write_atomic;
use crate::transport::{FolderTransport, RemotePath};
use std::fs;
use std::path::{Path, PathBuf};

/// A [`FolderTransport`] over a locally mounted shared folder (a cloud
/// drive mount, a network share, a USB stick).
///
/// Writes go through a sibling temp file and rename, so a concurrently
/// reading peer never observes a partial file. Reads of not-yet-synced
/// cloud content surface as retryable transport errors.
pub struct FsFolder {
    root: PathBuf,
}

impl FsFolder {
    /// Creates a transport rooted at `root`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the root cannot be created.
    pub fn open(root: &Path) -> SyncResult<Self> {
        fs::create_dir_all(root).map_err(|e| io_to_transport(&e, "create folder root"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The local mount point of the shared folder.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &RemotePath) -> PathBuf {
        let mut full = self.root.clone();
        for component in path.as_str().split('/').filter(|c| !c.is_empty()) {
            full.push(component);
        }
        full
    }
}

impl FolderTransport for FsFolder {
    fn list_dir(&self, path: &RemotePath) -> SyncResult<Vec<String>> {
        let dir = self.resolve(path);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|e| io_to_transport(&e, "list directory"))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_to_transport(&e, "list directory"))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, path: &RemotePath) -> SyncResult<Vec<u8>> {
        fs::read(self.resolve(path)).map_err(|e| io_to_transport(&e, "read file"))
    }

    fn write_file_atomic(&self, path: &RemotePath, bytes: &[u8]) -> SyncResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_to_transport(&e, "create directory"))?;
        }
        write_atomic(&full, bytes).map_err(|e| io_to_transport(&e, "write file"))
    }

    fn exists(&self, path: &RemotePath) -> SyncResult<bool> {
        Ok(self.resolve(path).exists())
    }

    fn copy_to_local(&self, path: &RemotePath, dest: &Path) -> SyncResult<()> {
        let src = self.resolve(path);
        let tmp = dest.with_extension("download");
        let result = fs::copy(&src, &tmp).and_then(|_| fs::rename(&tmp, dest));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
            .map(|_| ())
            .map_err(|e| io_to_transport(&e, "download file"))
    }

    fn copy_from_local(&self, src: &Path, path: &RemotePath) -> SyncResult<()> {
        let bytes = fs::read(src).map_err(|e| io_to_transport(&e, "read local file"))?;
        self.write_file_atomic(path, &bytes)
    }
}
