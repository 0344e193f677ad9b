//! # Tideflow Queue
//!
//! The queue abstraction the workflow engine consumes: at-least-once,
//! best-effort FIFO per topic, idempotency-key deduplication over a
//! bounded window, and visibility timeouts driven by handler return
//! values.
//!
//! The engine uses exactly two topic shapes — `workflow_<name>` for
//! dispatcher re-entry and `step_<name>` for step execution — and never
//! assumes anything else about the backend.

pub mod memory;
pub mod queue;

pub use memory::{MemoryQueue, MemoryQueueConfig};
pub use queue::{
    step_topic, workflow_topic, EnqueueOptions, HandlerContext, HandlerOutcome, MessageHandler,
    QueueError, WorkQueue, STEP_TOPIC_PREFIX, WORKFLOW_TOPIC_PREFIX,
};
