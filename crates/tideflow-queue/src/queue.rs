//! WorkQueue trait definition

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Topic prefix for workflow dispatcher messages
pub const WORKFLOW_TOPIC_PREFIX: &str = "workflow_";

/// Topic prefix for step execution messages
pub const STEP_TOPIC_PREFIX: &str = "step_";

/// Topic carrying re-entry messages for one workflow name
pub fn workflow_topic(workflow_name: &str) -> String {
    format!("{WORKFLOW_TOPIC_PREFIX}{workflow_name}")
}

/// Topic carrying execution messages for one step name
pub fn step_topic(step_name: &str) -> String {
    format!("{STEP_TOPIC_PREFIX}{step_name}")
}

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// I/O or delivery failure; always retryable at the queue layer
    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("queue is shut down")]
    Shutdown,
}

/// Options for [`WorkQueue::enqueue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Deduplication key; a second enqueue with the same key within the
    /// backend's window is dropped
    pub idempotency_key: Option<String>,

    /// Deployment the message belongs to (routing metadata)
    pub deployment_id: Option<String>,

    /// Keep the message invisible for this long before first delivery
    pub visibility_delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_idempotency_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_visibility_delay(mut self, delay: Duration) -> Self {
        self.visibility_delay = Some(delay);
        self
    }
}

/// Delivery metadata passed to handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub queue_name: String,
    pub message_id: Uuid,

    /// 1-based delivery attempt
    pub attempt: u32,
}

/// What the handler wants done with the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Acknowledge: the message is done
    Ack,

    /// Keep the message invisible for this long, then redeliver
    Delay { timeout: Duration },
}

/// Consumer callback registered for a topic prefix
///
/// An `Err` is a transport-level failure: the message stays on the queue
/// and redelivers with backoff.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        payload: Value,
        ctx: HandlerContext,
    ) -> Result<HandlerOutcome, anyhow::Error>;
}

/// Minimal queue contract the engine consumes
///
/// Delivery is at-least-once and best-effort FIFO per topic. Backends cap
/// message visibility; callers needing longer delays re-enqueue in
/// chunks.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Enqueue a message on a topic
    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError>;

    /// Register a handler for every topic matching `topic_prefix`
    async fn create_handler(
        &self,
        topic_prefix: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError>;

    /// Longest visibility delay the backend honors in one hop
    fn max_visibility(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    /// Stop delivering and drain in-flight handlers
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_shapes() {
        assert_eq!(workflow_topic("order"), "workflow_order");
        assert_eq!(step_topic("fetch_user"), "step_fetch_user");
        assert!(workflow_topic("x").starts_with(WORKFLOW_TOPIC_PREFIX));
        assert!(step_topic("x").starts_with(STEP_TOPIC_PREFIX));
    }

    #[test]
    fn test_enqueue_options_builders() {
        let options = EnqueueOptions::with_idempotency_key("fetch#0")
            .with_visibility_delay(Duration::from_secs(5));
        assert_eq!(options.idempotency_key.as_deref(), Some("fetch#0"));
        assert_eq!(options.visibility_delay, Some(Duration::from_secs(5)));
    }
}
