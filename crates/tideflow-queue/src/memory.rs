//! In-memory implementation of WorkQueue
//!
//! Backs local development and tests. Messages live in per-topic vectors
//! ordered by enqueue sequence; a dispatcher task delivers due messages
//! to registered handlers under a concurrency cap. Visibility timeouts,
//! idempotency-key dedup, and failure backoff match the semantics a
//! durable backend provides.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::queue::{
    EnqueueOptions, HandlerContext, HandlerOutcome, MessageHandler, QueueError, WorkQueue,
};

/// Tuning for [`MemoryQueue`]
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// How often the dispatcher scans for due messages
    pub poll_interval: Duration,

    /// Concurrent handler executions across all topics
    pub max_concurrency: usize,

    /// Idempotency-key deduplication window
    pub dedup_window: Duration,

    /// Longest visibility delay honored in one hop
    pub max_visibility: Duration,

    /// Base redelivery backoff after a transport failure
    pub failure_backoff: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            max_concurrency: 16,
            dedup_window: Duration::from_secs(60 * 60),
            max_visibility: Duration::from_secs(24 * 60 * 60),
            failure_backoff: Duration::from_secs(1),
        }
    }
}

struct QueuedMessage {
    id: Uuid,
    seq: u64,
    payload: serde_json::Value,
    attempt: u32,
    visible_at: DateTime<Utc>,
    in_flight: bool,
}

struct Subscription {
    prefix: String,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Vec<QueuedMessage>>,
    subscriptions: Vec<Subscription>,
    dedup: HashMap<String, (Uuid, DateTime<Utc>)>,
    next_seq: u64,
    dispatcher_started: bool,
}

/// In-memory work queue
pub struct MemoryQueue {
    config: MemoryQueueConfig,
    inner: Arc<Mutex<Inner>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_config(MemoryQueueConfig::default())
    }

    pub fn with_config(config: MemoryQueueConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Messages not yet acknowledged, across all topics
    pub fn depth(&self) -> usize {
        self.inner.lock().topics.values().map(Vec::len).sum()
    }

    fn spawn_dispatcher(&self) {
        let inner = Arc::clone(&self.inner);
        let permits = Arc::clone(&self.permits);
        let tasks = self.tasks.clone();
        let cancel = self.cancel.clone();
        let config = self.config.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }

                let due = claim_due(&inner);
                for (topic, message_id, payload, attempt, handler) in due {
                    let permit = match Arc::clone(&permits).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let inner = Arc::clone(&inner);
                    let config = config.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let ctx = HandlerContext {
                            queue_name: topic.clone(),
                            message_id,
                            attempt,
                        };

                        // An inner spawn turns handler panics into join
                        // errors, which redeliver like transport failures.
                        let joined = tokio::spawn(async move {
                            handler.handle(payload, ctx).await
                        })
                        .await;

                        let outcome = match joined {
                            Ok(Ok(outcome)) => Ok(outcome),
                            Ok(Err(error)) => Err(error.to_string()),
                            Err(join_error) => Err(join_error.to_string()),
                        };
                        settle(&inner, &config, &topic, message_id, attempt, outcome);
                    });
                }
            }
        });
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Claim the next due message of each topic, oldest first.
///
/// One in-flight message per topic keeps delivery FIFO; topics proceed
/// in parallel.
#[allow(clippy::type_complexity)]
fn claim_due(
    inner: &Mutex<Inner>,
) -> Vec<(String, Uuid, serde_json::Value, u32, Arc<dyn MessageHandler>)> {
    let now = Utc::now();
    let mut inner = inner.lock();
    let mut due = Vec::new();

    let subscriptions: Vec<(String, Arc<dyn MessageHandler>)> = inner
        .subscriptions
        .iter()
        .map(|s| (s.prefix.clone(), Arc::clone(&s.handler)))
        .collect();

    for (topic, messages) in inner.topics.iter_mut() {
        let Some((_, handler)) = subscriptions
            .iter()
            .find(|(prefix, _)| topic.starts_with(prefix.as_str()))
        else {
            continue;
        };

        if messages.iter().any(|m| m.in_flight) {
            continue;
        }

        messages.sort_by_key(|m| m.seq);
        if let Some(message) = messages
            .iter_mut()
            .find(|m| m.visible_at <= now)
        {
            message.in_flight = true;
            message.attempt += 1;
            due.push((
                topic.clone(),
                message.id,
                message.payload.clone(),
                message.attempt,
                Arc::clone(handler),
            ));
        }
    }

    due
}

/// Apply a handler outcome to the stored message.
fn settle(
    inner: &Mutex<Inner>,
    config: &MemoryQueueConfig,
    topic: &str,
    message_id: Uuid,
    attempt: u32,
    outcome: Result<HandlerOutcome, String>,
) {
    let now = Utc::now();
    let mut inner = inner.lock();
    let Some(messages) = inner.topics.get_mut(topic) else {
        return;
    };

    match outcome {
        Ok(HandlerOutcome::Ack) => {
            messages.retain(|m| m.id != message_id);
        }
        Ok(HandlerOutcome::Delay { timeout }) => {
            if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                let timeout = timeout.min(config.max_visibility);
                message.visible_at = now + chrono::Duration::from_std(timeout).unwrap_or_default();
                message.in_flight = false;
            }
        }
        Err(error) => {
            tracing::warn!(%topic, %message_id, attempt, %error, "handler failed; message will redeliver");
            if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                let exponent = attempt.saturating_sub(1).min(6);
                let backoff = config
                    .failure_backoff
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(Duration::from_secs(60));
                message.visible_at = now + chrono::Duration::from_std(backoff).unwrap_or_default();
                message.in_flight = false;
            }
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Shutdown);
        }

        let now = Utc::now();
        let mut inner = self.inner.lock();

        // Expire old dedup entries before consulting the window.
        let window = chrono::Duration::from_std(self.config.dedup_window).unwrap_or_default();
        inner.dedup.retain(|_, (_, at)| now - *at < window);

        let dedup_key = options
            .idempotency_key
            .as_ref()
            .map(|key| format!("{topic}\u{1}{key}"));
        if let Some(key) = &dedup_key {
            if let Some((existing, _)) = inner.dedup.get(key) {
                tracing::debug!(%topic, idempotency_key = %key, "deduplicated enqueue");
                return Ok(*existing);
            }
        }

        let id = Uuid::now_v7();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let delay = options
            .visibility_delay
            .unwrap_or(Duration::ZERO)
            .min(self.config.max_visibility);
        let message = QueuedMessage {
            id,
            seq,
            payload,
            attempt: 0,
            visible_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
            in_flight: false,
        };

        inner.topics.entry(topic.to_string()).or_default().push(message);
        if let Some(key) = dedup_key {
            inner.dedup.insert(key, (id, now));
        }

        Ok(id)
    }

    async fn create_handler(
        &self,
        topic_prefix: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Shutdown);
        }

        let start_dispatcher = {
            let mut inner = self.inner.lock();
            inner.subscriptions.push(Subscription {
                prefix: topic_prefix.to_string(),
                handler,
            });
            !std::mem::replace(&mut inner.dispatcher_started, true)
        };

        if start_dispatcher {
            self.spawn_dispatcher();
        }
        Ok(())
    }

    fn max_visibility(&self) -> Duration {
        self.config.max_visibility
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn fast_config() -> MemoryQueueConfig {
        MemoryQueueConfig {
            poll_interval: Duration::from_millis(5),
            failure_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Handler that records deliveries and replays scripted outcomes.
    struct ScriptedHandler {
        seen: Arc<PlMutex<Vec<(String, u32, serde_json::Value)>>>,
        script: PlMutex<Vec<Result<HandlerOutcome, String>>>,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Result<HandlerOutcome, String>>) -> Arc<Self> {
            Arc::new(Self {
                seen: Arc::new(PlMutex::new(Vec::new())),
                script: PlMutex::new(script),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(
            &self,
            payload: serde_json::Value,
            ctx: HandlerContext,
        ) -> Result<HandlerOutcome, anyhow::Error> {
            self.seen
                .lock()
                .push((ctx.queue_name.clone(), ctx.attempt, payload));
            let next = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    Ok(HandlerOutcome::Ack)
                } else {
                    script.remove(0)
                }
            };
            next.map_err(|message| anyhow::anyhow!(message))
        }
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_ack() {
        let queue = MemoryQueue::with_config(fast_config());
        let handler = ScriptedHandler::new(vec![]);
        queue.create_handler("workflow_", handler.clone()).await.unwrap();

        queue
            .enqueue("workflow_order", json!({"run": 1}), EnqueueOptions::default())
            .await
            .unwrap();

        wait_until(2_000, || queue.depth() == 0).await;
        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "workflow_order");
        assert_eq!(seen[0].1, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_within_topic() {
        let queue = MemoryQueue::with_config(fast_config());
        let handler = ScriptedHandler::new(vec![]);
        queue.create_handler("step_", handler.clone()).await.unwrap();

        for n in 0..5 {
            queue
                .enqueue("step_fetch", json!({ "n": n }), EnqueueOptions::default())
                .await
                .unwrap();
        }

        wait_until(2_000, || handler.seen.lock().len() == 5).await;
        let order: Vec<i64> = handler
            .seen
            .lock()
            .iter()
            .map(|(_, _, payload)| payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        queue.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_delay_outcome_redelivers_with_higher_attempt() {
        let queue = MemoryQueue::with_config(fast_config());
        let handler = ScriptedHandler::new(vec![Ok(HandlerOutcome::Delay {
            timeout: Duration::from_millis(20),
        })]);
        queue.create_handler("step_", handler.clone()).await.unwrap();

        queue
            .enqueue("step_fetch", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        wait_until(2_000, || handler.seen.lock().len() == 2).await;
        let seen = handler.seen.lock();
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[1].1, 2);
        drop(seen);
        queue.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_transport_error_backs_off_and_redelivers() {
        let queue = MemoryQueue::with_config(fast_config());
        let handler = ScriptedHandler::new(vec![Err("connection reset".to_string())]);
        queue.create_handler("workflow_", handler.clone()).await.unwrap();

        queue
            .enqueue("workflow_order", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        wait_until(2_000, || queue.depth() == 0).await;
        assert_eq!(handler.seen.lock().len(), 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_idempotency_key_dedup() {
        let queue = MemoryQueue::with_config(fast_config());
        let handler = ScriptedHandler::new(vec![]);
        queue.create_handler("step_", handler.clone()).await.unwrap();

        let first = queue
            .enqueue(
                "step_fetch",
                json!({}),
                EnqueueOptions::with_idempotency_key("fetch#0"),
            )
            .await
            .unwrap();
        let second = queue
            .enqueue(
                "step_fetch",
                json!({}),
                EnqueueOptions::with_idempotency_key("fetch#0"),
            )
            .await
            .unwrap();
        assert_eq!(first, second);

        wait_until(2_000, || queue.depth() == 0).await;
        assert_eq!(handler.seen.lock().len(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_prefix_routing() {
        let queue = MemoryQueue::with_config(fast_config());
        let workflows = ScriptedHandler::new(vec![]);
        let steps = ScriptedHandler::new(vec![]);
        queue.create_handler("workflow_", workflows.clone()).await.unwrap();
        queue.create_handler("step_", steps.clone()).await.unwrap();

        queue
            .enqueue("workflow_order", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .enqueue("step_fetch", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        wait_until(2_000, || queue.depth() == 0).await;
        assert_eq!(workflows.seen.lock().len(), 1);
        assert_eq!(steps.seen.lock().len(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let queue = MemoryQueue::with_config(fast_config());
        queue.shutdown().await;
        let result = queue
            .enqueue("workflow_x", json!({}), EnqueueOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::Shutdown)));
    }
}
