//! Engine facade: registration, queue wiring, and the public operations
//!
//! The engine owns the registries and a cached world handle, subscribes
//! the two topic prefixes on `start()`, and exposes the caller-facing
//! operations: starting runs, cancelling them, and delivering hook
//! payloads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use tideflow_core::{
    CodecError, EventInput, EventPayload, Manifest, Page, PageRequest, Run, SortOrder,
};
use tideflow_queue::{
    HandlerContext, HandlerOutcome, MessageHandler, QueueError, STEP_TOPIC_PREFIX,
    WORKFLOW_TOPIC_PREFIX,
};
use tideflow_storage::{RunFilter, StoreError};

use crate::dispatcher::WorkflowDispatcher;
use crate::executor::StepExecutor;
use crate::registry::{StepOptions, StepRegistry, WorkflowRegistry};
use crate::suspension::enqueue_workflow;
use crate::world::World;
use crate::{StepHandler, WorkflowHandler};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no world configured")]
    NoWorld,

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Queue payload for workflow dispatch passes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMessage {
    pub run_id: Uuid,
    pub workflow_name: String,

    /// Trace carrier propagated across the queue hop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<HashMap<String, String>>,
}

/// Queue payload for step executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMessage {
    pub workflow_name: String,
    pub run_id: Uuid,
    pub step_id: String,
    pub workflow_started_at: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<HashMap<String, String>>,
}

/// Options for starting a run
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub deployment_id: Option<String>,

    /// Opaque globals made available to replay primitives
    pub execution_context: Option<Value>,
}

struct EngineInner {
    world: RwLock<Option<World>>,
    workflows: Arc<RwLock<WorkflowRegistry>>,
    steps: Arc<RwLock<StepRegistry>>,
    manifest: RwLock<Option<Manifest>>,
}

/// The workflow engine
///
/// Cheap to clone; clones share registries and the cached world.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(world: World) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                world: RwLock::new(Some(world)),
                workflows: Arc::new(RwLock::new(WorkflowRegistry::new())),
                steps: Arc::new(RwLock::new(StepRegistry::new())),
                manifest: RwLock::new(None),
            }),
        }
    }

    /// Construct against the world selected by the environment
    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Self::new(crate::world::world_from_env()?))
    }

    /// Attach the build manifest; registrations are checked against it
    pub fn with_manifest(self, manifest: Manifest) -> Self {
        *self.inner.manifest.write() = Some(manifest);
        self
    }

    /// Replace or clear the cached world handle
    pub fn set_world(&self, world: Option<World>) {
        *self.inner.world.write() = world;
    }

    pub fn world(&self) -> Result<World, EngineError> {
        self.inner.world.read().clone().ok_or(EngineError::NoWorld)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_workflow(&self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        let name = name.into();
        if let Some(manifest) = self.inner.manifest.read().as_ref() {
            if !manifest.has_workflow(&name) {
                warn!(workflow = %name, "registered workflow is not in the build manifest");
            }
        }
        info!(workflow = %name, "registered workflow");
        self.inner.workflows.write().register(name, handler);
    }

    pub fn register_step(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
        options: StepOptions,
    ) {
        let name = name.into();
        if let Some(manifest) = self.inner.manifest.read().as_ref() {
            if !manifest.has_step(&name) {
                warn!(step = %name, "registered step is not in the build manifest");
            }
        }
        info!(step = %name, "registered step");
        self.inner.steps.write().register(name, handler, options);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribe the queue handlers and start the storage backend.
    pub async fn start(&self) -> Result<(), EngineError> {
        let world = self.world()?;
        world.storage.start().await?;

        world
            .queue
            .create_handler(
                WORKFLOW_TOPIC_PREFIX,
                Arc::new(WorkflowQueueHandler {
                    engine: self.clone(),
                }),
            )
            .await?;
        world
            .queue
            .create_handler(
                STEP_TOPIC_PREFIX,
                Arc::new(StepQueueHandler {
                    engine: self.clone(),
                }),
            )
            .await?;

        info!("engine started");
        Ok(())
    }

    /// Stop delivery and drain in-flight handlers.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let world = self.world()?;
        world.queue.shutdown().await;
        info!("engine stopped");
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Start a new run of a registered workflow.
    pub async fn start_run(&self, workflow_name: &str, input: Value) -> Result<Uuid, EngineError> {
        self.start_run_with(workflow_name, input, StartOptions::default())
            .await
    }

    pub async fn start_run_with(
        &self,
        workflow_name: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<Uuid, EngineError> {
        if !self.inner.workflows.read().contains(workflow_name) {
            return Err(EngineError::UnknownWorkflow(workflow_name.to_string()));
        }
        let world = self.world()?;

        let mut ops = Vec::new();
        // Run id is not allocated yet; input-level stream ops are keyed
        // by the nil id.
        let dehydrated_input = world.codec.dehydrate(&input, &mut ops, Uuid::nil())?;
        let execution_context = options
            .execution_context
            .as_ref()
            .map(|value| world.codec.dehydrate(value, &mut ops, Uuid::nil()))
            .transpose()?;
        join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let record = world
            .storage
            .create_event(
                None,
                EventInput::new(EventPayload::RunCreated {
                    workflow_name: workflow_name.to_string(),
                    deployment_id: options.deployment_id,
                    input: dehydrated_input,
                    execution_context,
                }),
            )
            .await?;
        let run_id = record
            .run
            .as_ref()
            .map(|run| run.run_id)
            .ok_or_else(|| EngineError::InvalidMessage("run_created returned no run".into()))?;

        enqueue_workflow(
            &world,
            workflow_name,
            run_id,
            format!("run-created:{run_id}"),
        )
        .await?;

        info!(%run_id, workflow = %workflow_name, "run started");
        Ok(run_id)
    }

    /// Cancel a run; idempotent on an already-cancelled run.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let world = self.world()?;
        let record = world
            .storage
            .create_event(Some(run_id), EventInput::new(EventPayload::RunCancelled))
            .await?;
        record
            .run
            .ok_or_else(|| EngineError::InvalidMessage("run_cancelled returned no run".into()))
    }

    /// Deliver a payload to a live hook and wake its workflow.
    pub async fn send_hook(&self, token: &str, payload: Value) -> Result<Uuid, EngineError> {
        let world = self.world()?;
        let hook = world.storage.get_hook_by_token(token).await?;
        let run = world.storage.get_run(hook.run_id).await?;

        let mut ops = Vec::new();
        let dehydrated = world.codec.dehydrate(&payload, &mut ops, hook.run_id)?;
        join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let record = world
            .storage
            .create_event(
                Some(hook.run_id),
                EventInput::new(EventPayload::HookReceived {
                    payload: dehydrated,
                })
                .with_correlation(hook.hook_id.clone()),
            )
            .await?;

        let key = record
            .event
            .map(|event| format!("wf:{}:{}", hook.run_id, event.event_id))
            .unwrap_or_else(|| format!("wf:{}:hook:{}", hook.run_id, hook.hook_id));
        enqueue_workflow(&world, &run.workflow_name, hook.run_id, key).await?;

        info!(run_id = %hook.run_id, hook_id = %hook.hook_id, "hook payload delivered");
        Ok(hook.run_id)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        Ok(self.world()?.storage.get_run(run_id).await?)
    }

    pub async fn list_runs(
        &self,
        filter: RunFilter,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Run>, EngineError> {
        Ok(self.world()?.storage.list_runs(filter, order, page).await?)
    }

    // =========================================================================
    // Internal wiring
    // =========================================================================

    fn dispatcher(&self) -> Result<WorkflowDispatcher, EngineError> {
        Ok(WorkflowDispatcher::new(
            self.world()?,
            Arc::clone(&self.inner.workflows),
        ))
    }

    fn executor(&self) -> Result<StepExecutor, EngineError> {
        Ok(StepExecutor::new(
            self.world()?,
            Arc::clone(&self.inner.steps),
        ))
    }
}

struct WorkflowQueueHandler {
    engine: Engine,
}

#[async_trait]
impl MessageHandler for WorkflowQueueHandler {
    async fn handle(
        &self,
        payload: Value,
        ctx: HandlerContext,
    ) -> Result<HandlerOutcome, anyhow::Error> {
        let message: WorkflowMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                // A malformed message redelivers forever; drop it.
                warn!(queue = %ctx.queue_name, %err, "dropping malformed workflow message");
                return Ok(HandlerOutcome::Ack);
            }
        };

        match self.engine.dispatcher()?.dispatch(message.run_id).await {
            Ok(outcome) => Ok(match outcome.redeliver_after {
                Some(timeout) => HandlerOutcome::Delay { timeout },
                None => HandlerOutcome::Ack,
            }),
            Err(EngineError::Store(StoreError::NotFound(what))) => {
                warn!(run_id = %message.run_id, %what, "run vanished; dropping message");
                Ok(HandlerOutcome::Ack)
            }
            Err(err) => Err(err.into()),
        }
    }
}

struct StepQueueHandler {
    engine: Engine,
}

#[async_trait]
impl MessageHandler for StepQueueHandler {
    async fn handle(
        &self,
        payload: Value,
        ctx: HandlerContext,
    ) -> Result<HandlerOutcome, anyhow::Error> {
        let message: StepMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(queue = %ctx.queue_name, %err, "dropping malformed step message");
                return Ok(HandlerOutcome::Ack);
            }
        };

        match self.engine.executor()?.execute(&message).await {
            Ok(Some(timeout)) => Ok(HandlerOutcome::Delay { timeout }),
            Ok(None) => Ok(HandlerOutcome::Ack),
            Err(EngineError::Store(StoreError::NotFound(what))) => {
                warn!(run_id = %message.run_id, %what, "step target vanished; dropping message");
                Ok(HandlerOutcome::Ack)
            }
            Err(err) => Err(err.into()),
        }
    }
}
