//! # ubisync Model
//!
//! Change-log data model for ubisync.
//!
//! This crate provides:
//! - [`SyncId`], [`DeviceId`], [`DocumentId`] identifier newtypes
//! - [`Timestamp`] (milliseconds since the Unix epoch)
//! - [`Change`] / [`ChangeKind`] mutation records
//! - [`ChangeSet`], the atomic unit of transport and replay
//! - [`StoreManifest`] metadata for whole-store uploads
//! - CBOR encoding/decoding for everything that crosses a device boundary
//!
//! This is a pure data crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - A change owns only the identifier of the entity it mutates, never the
//!   entity itself
//! - A change set preserves the generation order of its changes
//! - Change sets totally order by `(timestamp, device_id)`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod change_set;
mod error;
mod id;
mod manifest;
mod timestamp;
mod value;

pub use change::{Change, ChangeKind};
pub use change_set::{sort_for_replay, ChangeSet};
pub use error::{ModelError, ModelResult};
pub use id::{DeviceId, DocumentId, SyncId};
pub use manifest::StoreManifest;
pub use timestamp::Timestamp;
pub use value::AttributeValue;
