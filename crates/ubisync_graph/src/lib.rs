//! # ubisync Graph
//!
//! The local object-graph collaborator for ubisync.
//!
//! This crate provides:
//! - [`SyncedEntity`], a replicated entity with per-attribute write stamps
//! - [`WriteContext`] / [`WriteOrigin`], the explicit organic-vs-replay mode
//!   every mutation is performed under
//! - [`ObjectGraph`], the seam the sync engine mutates entities through
//! - [`LocalChangeSource`], the commit-time batching seam
//! - [`MemoryGraph`], an in-memory implementation for tests and ephemeral
//!   documents
//!
//! ## Key Invariants
//!
//! - Organic mutations record changes; replay mutations never do
//! - A replayed attribute write older than the attribute's current stamp
//!   is suppressed (last write wins per field)
//! - A deleted sync ID is tombstoned forever; resurrection is disallowed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod graph;
mod memory;
mod recorder;

pub use entity::SyncedEntity;
pub use error::{GraphError, GraphResult};
pub use graph::{LocalChangeSource, ObjectGraph, WriteContext, WriteOrigin};
pub use memory::MemoryGraph;
pub use recorder::ChangeRecorder;
