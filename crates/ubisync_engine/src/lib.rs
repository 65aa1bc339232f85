//! # ubisync Engine
//!
//! Folder-based sync engine for ubisync documents.
//!
//! This crate provides:
//! - Per-document sync coordinator with pull → apply → push cycles
//! - Change-set stores (in-memory and file-backed) with peer watermarks
//! - Conflict-aware replay of remote change sets
//! - Folder transport abstraction (in-memory and local filesystem)
//! - Device registry over the shared folder layout
//! - Whole-store bootstrap for new devices
//!
//! ## Architecture
//!
//! Devices never talk to each other directly. Each device appends its
//! sealed change sets to its own sub-directory of a shared folder and
//! reads every other device's sub-directory on its own schedule:
//! 1. Discover peer devices under the document's `changes/` directory
//! 2. Pull change sets newer than each peer's watermark
//! 3. Replay them into the local object graph in global order
//! 4. Push local change sets not yet exported
//!
//! ## Key Invariants
//!
//! - Exported change-set files are immutable once written
//! - A peer watermark only advances past a fully applied change set
//! - Replay order is (timestamp, device ID) across all peers
//! - Cycles are resumable: an aborted cycle loses no progress

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod coordinator;
mod delegate;
mod error;
mod file_store;
mod fs_folder;
mod registry;
mod store;
mod transport;

pub use applier::{ApplyReport, ConflictApplier, SkipReason, SkippedChange};
pub use config::SyncConfig;
pub use coordinator::{SyncCoordinator, SyncCycleReport, SyncPhase, SyncStats};
pub use delegate::{NoopDelegate, SyncDelegate};
pub use error::{SyncError, SyncResult};
pub use file_store::FileChangeSetStore;
pub use fs_folder::FsFolder;
pub use registry::DeviceRegistry;
pub use store::{ChangeSetStore, MemoryChangeSetStore};
pub use transport::{FolderTransport, MemoryFolder, RemotePath};
