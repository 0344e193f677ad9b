//! Materializes suspensions to storage and the queue
//!
//! Pending items discovered during a replay pass are processed in strict
//! type order: hooks first (their tokens must be addressable before any
//! step runs), then steps and waits in parallel. Duplicate-creation
//! conflicts are expected under queue redelivery and continue; a run
//! that went terminal mid-flight stops cleanly.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use tideflow_core::{EventInput, EventPayload, Run};
use tideflow_queue::{step_topic, workflow_topic, EnqueueOptions};
use tideflow_storage::StoreError;

use crate::context::PendingItem;
use crate::engine::{EngineError, StepMessage};
use crate::world::World;

/// Minimum visibility delay for a wait, in seconds
const MIN_WAIT_DELAY_SECS: u64 = 1;

pub struct SuspensionHandler {
    world: World,
}

impl SuspensionHandler {
    pub fn new(world: World) -> Self {
        Self { world }
    }

    /// Persist pending items and enqueue their work. Returns the minimum
    /// wait delay, to be used as the workflow re-enqueue hint.
    pub async fn materialize(
        &self,
        run: &Run,
        items: Vec<PendingItem>,
    ) -> Result<Option<Duration>, EngineError> {
        let mut hooks = Vec::new();
        let mut steps = Vec::new();
        let mut waits = Vec::new();
        for item in items {
            match item {
                PendingItem::Hook { .. } => hooks.push(item),
                PendingItem::Step { .. } => steps.push(item),
                PendingItem::Wait { .. } => waits.push(item),
            }
        }

        // Hooks first, in parallel.
        let results = join_all(hooks.iter().map(|item| self.create_hook(run, item))).await;
        for result in results {
            result?;
        }

        // Steps and waits in parallel.
        let step_futures = steps.iter().map(|item| self.create_step(run, item));
        let wait_futures = waits.iter().map(|item| self.create_wait(run, item));
        let (step_results, wait_results) =
            tokio::join!(join_all(step_futures), join_all(wait_futures));

        for result in step_results {
            result?;
        }
        let mut min_delay: Option<Duration> = None;
        for result in wait_results {
            if let Some(delay) = result? {
                min_delay = Some(match min_delay {
                    Some(current) => current.min(delay),
                    None => delay,
                });
            }
        }

        Ok(min_delay)
    }

    async fn create_hook(&self, run: &Run, item: &PendingItem) -> Result<(), EngineError> {
        let PendingItem::Hook {
            correlation_id,
            token,
            metadata,
        } = item
        else {
            return Ok(());
        };

        let metadata = match metadata {
            Some(value) => {
                let mut ops = Vec::new();
                let form = self.world.codec.dehydrate(value, &mut ops, run.run_id)?;
                join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;
                Some(form)
            }
            None => None,
        };

        let input = EventInput::new(EventPayload::HookCreated {
            token: token.clone(),
            metadata,
        })
        .with_correlation(correlation_id.clone());

        match self.world.storage.create_event(Some(run.run_id), input).await {
            Ok(_) => Ok(()),
            // Already exists: expected on retry.
            Err(err) if err.is_duplicate() => {
                debug!(run_id = %run.run_id, %correlation_id, "hook already materialized");
                Ok(())
            }
            // Run finished while we were suspending: stop cleanly.
            Err(err) if err.is_terminal_conflict() => Ok(()),
            Err(StoreError::Gone(reason)) => {
                debug!(run_id = %run.run_id, %correlation_id, %reason, "hook target gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_step(&self, run: &Run, item: &PendingItem) -> Result<(), EngineError> {
        let PendingItem::Step {
            correlation_id,
            step_name,
            input,
        } = item
        else {
            return Ok(());
        };

        let mut ops = Vec::new();
        let dehydrated = self.world.codec.dehydrate(input, &mut ops, run.run_id)?;
        join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let event = EventInput::new(EventPayload::StepCreated {
            step_name: step_name.clone(),
            input: dehydrated,
        })
        .with_correlation(correlation_id.clone());

        match self.world.storage.create_event(Some(run.run_id), event).await {
            Ok(_) => {}
            // A prior attempt created the step but may have crashed
            // before the queue write: continue to the enqueue.
            Err(err) if err.is_duplicate() => {
                debug!(run_id = %run.run_id, %correlation_id, "step already created");
            }
            Err(err) if err.is_terminal_conflict() => return Ok(()),
            Err(StoreError::Gone(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        // The queue write is unconditional; the idempotency key keeps
        // redelivered suspensions from fanning out duplicates.
        let message = StepMessage {
            workflow_name: run.workflow_name.clone(),
            run_id: run.run_id,
            step_id: correlation_id.clone(),
            workflow_started_at: run.started_at,
            requested_at: Utc::now(),
            trace: None,
        };
        let mut options = EnqueueOptions::with_idempotency_key(correlation_id.clone());
        options.deployment_id = run.deployment_id.clone();
        self.world
            .queue
            .enqueue(
                &step_topic(step_name),
                serde_json::to_value(&message)
                    .map_err(|e| EngineError::InvalidMessage(e.to_string()))?,
                options,
            )
            .await?;

        debug!(run_id = %run.run_id, %correlation_id, %step_name, "step enqueued");
        Ok(())
    }

    async fn create_wait(
        &self,
        run: &Run,
        item: &PendingItem,
    ) -> Result<Option<Duration>, EngineError> {
        let PendingItem::Wait {
            correlation_id,
            resume_at,
        } = item
        else {
            return Ok(None);
        };

        let event = EventInput::new(EventPayload::WaitCreated {
            resume_at: *resume_at,
        })
        .with_correlation(correlation_id.clone());

        match self.world.storage.create_event(Some(run.run_id), event).await {
            Ok(_) => {}
            Err(err) if err.is_duplicate() => {}
            Err(err) if err.is_terminal_conflict() => return Ok(None),
            Err(StoreError::Gone(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let millis = (*resume_at - Utc::now()).num_milliseconds().max(0) as u64;
        let delay_secs = millis.div_ceil(1000).max(MIN_WAIT_DELAY_SECS);
        Ok(Some(Duration::from_secs(delay_secs)))
    }
}

/// Re-enqueue a workflow for another dispatch pass.
///
/// Used by the step executor after terminal step events and by hook
/// delivery; the idempotency key ties the wakeup to the event that
/// caused it.
pub(crate) async fn enqueue_workflow(
    world: &World,
    workflow_name: &str,
    run_id: uuid::Uuid,
    idempotency_key: String,
) -> Result<(), EngineError> {
    let message = crate::engine::WorkflowMessage {
        run_id,
        workflow_name: workflow_name.to_string(),
        trace: None,
    };
    world
        .queue
        .enqueue(
            &workflow_topic(workflow_name),
            serde_json::to_value(&message).map_err(|e| EngineError::InvalidMessage(e.to_string()))?,
            EnqueueOptions::with_idempotency_key(idempotency_key),
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            warn!(%run_id, %workflow_name, %err, "workflow re-enqueue failed");
            EngineError::from(err)
        })
}
