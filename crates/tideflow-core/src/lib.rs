//! # Tideflow Core
//!
//! Shared data model for the Tideflow durable workflow runtime.
//!
//! This crate defines the four root entities (runs, steps, hooks, events),
//! the append-only event catalog, the error object carried by failed runs
//! and steps, cursor pagination, the serialization boundary (dehydrate /
//! hydrate), and the build-time workflow manifest.
//!
//! Everything here is passive data: the state machines that validate
//! transitions live in `tideflow-storage`, and the replay protocol that
//! consumes these types lives in `tideflow-engine`.

pub mod codec;
pub mod entity;
pub mod error;
pub mod event;
pub mod manifest;
pub mod page;

pub use codec::{Codec, CodecError, JsonCodec, Revivers, SerialForm, SideEffects, StreamRef};
pub use entity::{Hook, Namespace, Run, RunStatus, Step, StepStatus};
pub use error::{ErrorObject, StepFailure};
pub use event::{Event, EventInput, EventPayload, SPEC_VERSION};
pub use manifest::Manifest;
pub use page::{Cursor, Page, PageRequest, SortOrder};
