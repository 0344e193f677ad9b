//! Workflow dispatcher with replay support
//!
//! One dispatch pass executes a workflow body to its next suspension
//! point, using the event log as the authoritative record of prior
//! decisions. The pass is idempotent: re-dispatching with the same log
//! produces the same events and the same suspensions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tideflow_core::{
    ErrorObject, Event, EventInput, EventPayload, PageRequest, Run, RunStatus, SortOrder,
};
use tideflow_storage::StoreError;

use crate::context::{Interrupt, LogIndex, RunContext};
use crate::engine::EngineError;
use crate::registry::WorkflowRegistry;
use crate::suspension::SuspensionHandler;
use crate::world::World;

/// Redelivery delay after a retryable workflow-level error
const WORKFLOW_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Page size used when loading a run's log
const EVENT_PAGE_LIMIT: usize = 500;

/// Result of one dispatch pass
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The run reached a terminal status during this pass
    pub completed: bool,

    /// Keep the workflow message invisible this long before the next
    /// pass (minimum pending wait, or the retry delay)
    pub redeliver_after: Option<Duration>,
}

impl DispatchOutcome {
    fn done() -> Self {
        Self {
            completed: true,
            redeliver_after: None,
        }
    }

    fn suspended(delay: Option<Duration>) -> Self {
        Self {
            completed: false,
            redeliver_after: delay,
        }
    }
}

/// Drives workflow bodies over their event logs
pub struct WorkflowDispatcher {
    world: World,
    workflows: Arc<RwLock<WorkflowRegistry>>,
}

impl WorkflowDispatcher {
    pub fn new(world: World, workflows: Arc<RwLock<WorkflowRegistry>>) -> Self {
        Self { world, workflows }
    }

    /// Convenience constructor around an owned registry
    pub fn with_registry(world: World, workflows: WorkflowRegistry) -> Self {
        Self::new(world, Arc::new(RwLock::new(workflows)))
    }

    /// Execute one replay pass for a run.
    #[instrument(skip(self), fields(%run_id))]
    pub async fn dispatch(&self, run_id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let storage = &self.world.storage;
        let mut run = storage.get_run(run_id).await?;

        if run.status.is_terminal() {
            debug!(status = %run.status, "run already terminal");
            return Ok(DispatchOutcome::done());
        }

        // First pass over a fresh run records run_started.
        if run.status == RunStatus::Pending {
            match storage
                .create_event(Some(run_id), EventInput::new(EventPayload::RunStarted))
                .await
            {
                Ok(record) => {
                    if let Some(updated) = record.run {
                        run = updated;
                    }
                }
                // Lost the race against a concurrent first pass.
                Err(StoreError::Conflict { .. }) => {
                    run = storage.get_run(run_id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut events = self.load_log(run_id).await?;
        self.settle_due_waits(&run, &mut events).await?;

        let handler = self
            .workflows
            .read()
            .get(&run.workflow_name)
            .ok_or_else(|| EngineError::UnknownWorkflow(run.workflow_name.clone()))?;

        // Hydrate globals and input, then install the replay context.
        let codec = Arc::clone(&self.world.codec);
        let mut ops = Vec::new();
        let globals = match &run.execution_context {
            Some(form) => Some(codec.hydrate(form, &mut ops, run_id, None, None)?),
            None => None,
        };
        let input = codec.hydrate(&run.input, &mut ops, run_id, globals.as_ref(), None)?;
        join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let ctx = RunContext::new(run_id, &events, codec, globals, Utc::now());
        let result = handler.run(&ctx, input).await;
        join_all(ctx.take_ops())
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        match result {
            Ok(output) => {
                self.complete_run(&run, output).await?;
                Ok(DispatchOutcome::done())
            }

            Err(Interrupt::Suspend) => {
                let pending = ctx.take_invocations();
                debug!(pending = pending.len(), "workflow suspended");
                let min_wait = SuspensionHandler::new(self.world.clone())
                    .materialize(&run, pending)
                    .await?;
                Ok(DispatchOutcome::suspended(min_wait))
            }

            Err(Interrupt::Fatal(error)) => {
                self.fail_run(&run, error).await?;
                Ok(DispatchOutcome::done())
            }

            Err(Interrupt::Retryable(error)) => {
                warn!(%run_id, error = %error.message, "workflow error; will retry via redelivery");
                Ok(DispatchOutcome::suspended(Some(WORKFLOW_RETRY_DELAY)))
            }
        }
    }

    /// Load the complete event log in ascending time order.
    async fn load_log(&self, run_id: Uuid) -> Result<Vec<Event>, EngineError> {
        let mut events = Vec::new();
        let mut page = PageRequest::with_limit(EVENT_PAGE_LIMIT);
        loop {
            let result = self
                .world
                .storage
                .list_events(run_id, Some(SortOrder::Asc), page)
                .await?;
            events.extend(result.data);
            if !result.has_more {
                break;
            }
            page = PageRequest::with_limit(EVENT_PAGE_LIMIT);
            if let Some(cursor) = result.cursor {
                page = page.with_cursor(cursor);
            }
        }
        Ok(events)
    }

    /// Record `wait_completed` for every wait whose resume time has
    /// passed, so the replay primitives resolve purely from the log.
    async fn settle_due_waits(
        &self,
        run: &Run,
        events: &mut Vec<Event>,
    ) -> Result<(), EngineError> {
        let index = LogIndex::build(events);
        let now = Utc::now();

        for (correlation_id, resume_at) in &index.wait_created {
            if index.wait_completed.contains(correlation_id) || *resume_at > now {
                continue;
            }

            let input = EventInput::new(EventPayload::WaitCompleted)
                .with_correlation(correlation_id.clone());
            match self.world.storage.create_event(Some(run.run_id), input).await {
                Ok(record) => {
                    if let Some(event) = record.event {
                        debug!(run_id = %run.run_id, %correlation_id, "wait settled");
                        events.push(event);
                    }
                }
                // A concurrent pass settled it; replay will see it on the
                // next load.
                Err(err) if err.is_duplicate() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn complete_run(&self, run: &Run, output: serde_json::Value) -> Result<(), EngineError> {
        let mut ops = Vec::new();
        let dehydrated = self.world.codec.dehydrate(&output, &mut ops, run.run_id)?;
        join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let input = EventInput::new(EventPayload::RunCompleted { output: dehydrated });
        match self.world.storage.create_event(Some(run.run_id), input).await {
            Ok(_) => {
                info!(run_id = %run.run_id, workflow = %run.workflow_name, "run completed");
                Ok(())
            }
            // Cancelled while the body was finishing; the terminal state
            // stands.
            Err(err) if err.is_terminal_conflict() => {
                warn!(run_id = %run.run_id, "run went terminal before completion was recorded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fail_run(&self, run: &Run, error: ErrorObject) -> Result<(), EngineError> {
        let input = EventInput::new(EventPayload::RunFailed {
            error: error.clone(),
        });
        match self.world.storage.create_event(Some(run.run_id), input).await {
            Ok(_) => {
                info!(run_id = %run.run_id, workflow = %run.workflow_name, error = %error.message, "run failed");
                Ok(())
            }
            Err(err) if err.is_terminal_conflict() => {
                warn!(run_id = %run.run_id, "run went terminal before failure was recorded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
