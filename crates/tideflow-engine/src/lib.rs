//! # Tideflow Engine
//!
//! The execution engine of the Tideflow durable workflow runtime.
//!
//! A workflow is a user function whose non-deterministic side effects are
//! deferred to named steps. Between step boundaries the function can be
//! suspended and later re-entered: the dispatcher replays the run's event
//! log, every replay primitive resolves from recorded outcomes, and the
//! first primitive without an outcome raises a typed suspension that the
//! dispatcher materializes to storage and the queue.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Engine                                │
//! │  (registration, queue wiring, start/cancel/hook delivery)    │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                  │
//!            ▼                                  ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │    WorkflowDispatcher     │   │        StepExecutor          │
//! │ (replay, suspensions)     │   │ (attempts, retries, events)  │
//! └──────────────────────────┘   └──────────────────────────────┘
//!            │                                  │
//!            └───────────────┬──────────────────┘
//!                            ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │              World { storage, queue, codec }                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod suspension;
pub mod world;

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::{Flow, HookOptions, Interrupt, PendingItem, RunContext};
    pub use crate::engine::{Engine, EngineError};
    pub use crate::registry::{StepHandler, StepOptions, WorkflowHandler};
    pub use crate::retry::RetryPolicy;
    pub use crate::world::World;
    pub use tideflow_core::{ErrorObject, StepFailure};
}

pub use context::{Flow, HookOptions, Interrupt, PendingItem, RunContext};
pub use dispatcher::{DispatchOutcome, WorkflowDispatcher};
pub use engine::{Engine, EngineError, StartOptions, StepMessage, WorkflowMessage};
pub use executor::StepExecutor;
pub use registry::{StepHandler, StepOptions, StepRegistry, WorkflowHandler, WorkflowRegistry};
pub use retry::RetryPolicy;
pub use suspension::SuspensionHandler;
pub use world::{World, WorldSelector, LOCAL_DATA_DIR_ENV, TARGET_WORLD_ENV};
