//! # Tideflow Storage
//!
//! Event-sourced persistence for the Tideflow workflow runtime.
//!
//! The storage layer is the only place that validates entity state
//! machines: every mutation arrives as an event, is checked against the
//! projected run state, and is persisted together with the projection
//! update. Two backends ship in-tree:
//!
//! - [`MemoryStore`] — in-process, for tests and embedded use
//! - [`FsStore`] — one JSON file per entity under a data directory, for
//!   local development
//!
//! Both delegate validation and projection to the shared [`state`]
//! module, so entity state is a fold of the event log by construction.

pub mod fs;
pub mod memory;
pub mod state;
pub mod store;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use store::{ConflictKind, EventRecord, RunFilter, StoreError, WorkflowStore};
