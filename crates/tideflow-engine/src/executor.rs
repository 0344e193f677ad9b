//! Step executor
//!
//! Runs one attempt of one step from a queue message, honoring retry,
//! max-attempt, and timeout rules, and emits the step lifecycle events.
//! Step-body errors never cross the queue boundary: they are captured
//! into `step_failed` / `step_retrying` events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use tideflow_core::{ErrorObject, EventInput, EventPayload, Step, StepFailure};
use tideflow_storage::StoreError;

use crate::engine::{EngineError, StepMessage};
use crate::registry::StepRegistry;
use crate::suspension::enqueue_workflow;
use crate::world::World;

/// Floor for retry-after visibility delays, in seconds
const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Executes step attempts
pub struct StepExecutor {
    world: World,
    steps: Arc<RwLock<StepRegistry>>,
}

impl StepExecutor {
    pub fn new(world: World, steps: Arc<RwLock<StepRegistry>>) -> Self {
        Self { world, steps }
    }

    /// Handle one step message. `Ok(Some(delay))` keeps the message
    /// invisible for `delay`; `Ok(None)` acknowledges it.
    #[instrument(skip(self, message), fields(run_id = %message.run_id, step_id = %message.step_id))]
    pub async fn execute(&self, message: &StepMessage) -> Result<Option<Duration>, EngineError> {
        let storage = &self.world.storage;

        let step = match storage.get_step(message.run_id, &message.step_id).await {
            Ok(step) => step,
            Err(StoreError::NotFound(_)) => {
                // The unconditional enqueue can outlive a failed step
                // creation; nudge the workflow to re-materialize.
                warn!("step message without step entity");
                self.wake_workflow(message, format!("missing-step:{}", message.step_id))
                    .await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        // Not yet eligible: let the queue redeliver at the retry time.
        if let Some(retry_after) = step.retry_after {
            let now = Utc::now();
            if retry_after > now {
                let wait = (retry_after - now).to_std().unwrap_or(MIN_RETRY_DELAY);
                debug!(?wait, "step not yet eligible");
                return Ok(Some(wait.max(MIN_RETRY_DELAY)));
            }
        }

        let handler = self
            .steps
            .read()
            .handler(&step.step_name)
            .ok_or_else(|| EngineError::UnknownStep(step.step_name.clone()))?;
        let policy = self
            .steps
            .read()
            .retry_policy(&step.step_name)
            .unwrap_or_default();
        let max_attempts = policy.max_attempts();

        // Defensive upper guard: a redelivered message after all
        // attempts were consumed terminates the step instead of looping.
        if step.attempt > max_attempts {
            let error = ErrorObject::new(format!(
                "step \"{}\" exceeded max retries",
                step.step_name
            ));
            self.finish_step(message, &step, EventPayload::StepFailed { error })
                .await?;
            return Ok(None);
        }

        if step.status.is_terminal() {
            // The terminal event was written but the workflow wakeup may
            // have been lost; re-enqueue optimistically.
            debug!(status = %step.status, "step already terminal");
            self.wake_workflow(message, format!("terminal:{}", message.step_id))
                .await?;
            return Ok(None);
        }

        // Record the attempt; this is the only place `attempt` grows.
        let started = match storage
            .create_event(
                Some(message.run_id),
                EventInput::new(EventPayload::StepStarted).with_correlation(&message.step_id),
            )
            .await
        {
            Ok(record) => record.step.unwrap_or(step),
            Err(err) if err.is_terminal_conflict() => {
                debug!("run or step went terminal before start");
                self.wake_workflow(message, format!("terminal:{}", message.step_id))
                    .await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let mut ops = Vec::new();
        let input =
            self.world
                .codec
                .hydrate(&started.input, &mut ops, message.run_id, None, None)?;
        join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        info!(step = %started.step_name, attempt = started.attempt, "executing step");
        match handler.execute(input).await {
            Ok(output) => {
                let mut ops = Vec::new();
                let dehydrated =
                    self.world
                        .codec
                        .dehydrate(&output, &mut ops, message.run_id)?;
                join_all(ops).await.into_iter().collect::<Result<Vec<_>, _>>()?;

                self.finish_step(message, &started, EventPayload::StepCompleted {
                    output: dehydrated,
                })
                .await?;
                Ok(None)
            }

            Err(failure) => self.handle_failure(message, &started, failure, max_attempts).await,
        }
    }

    async fn handle_failure(
        &self,
        message: &StepMessage,
        step: &Step,
        failure: StepFailure,
        max_attempts: u32,
    ) -> Result<Option<Duration>, EngineError> {
        let error = failure.error_object().clone();

        if failure.is_fatal() {
            info!(step = %step.step_name, "step failed fatally");
            self.finish_step(message, step, EventPayload::StepFailed { error })
                .await?;
            return Ok(None);
        }

        // Post-failure check: this attempt already happened, so `>=`
        // decides whether any attempt remains.
        if step.attempt >= max_attempts {
            let exhausted = ErrorObject::new(format!(
                "step \"{}\" failed after {} retries: {}",
                step.step_name,
                max_attempts.saturating_sub(1),
                error.message
            ))
            .with_kind(error.kind.clone().unwrap_or_else(|| "retries_exhausted".into()));

            info!(step = %step.step_name, attempt = step.attempt, "step exhausted retries");
            self.finish_step(message, step, EventPayload::StepFailed { error: exhausted })
                .await?;
            return Ok(None);
        }

        let now = Utc::now();
        let policy = self
            .steps
            .read()
            .retry_policy(&step.step_name)
            .unwrap_or_default();
        let retry_after = failure
            .retry_after()
            .unwrap_or_else(|| policy.retry_at(now, step.attempt));

        match self
            .world
            .storage
            .create_event(
                Some(message.run_id),
                EventInput::new(EventPayload::StepRetrying {
                    error,
                    retry_after: Some(retry_after),
                })
                .with_correlation(&message.step_id),
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_terminal_conflict() => {
                self.wake_workflow(message, format!("terminal:{}", message.step_id))
                    .await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        let delay = (retry_after - now).to_std().unwrap_or(MIN_RETRY_DELAY);
        debug!(step = %step.step_name, attempt = step.attempt, ?delay, "step will retry");
        Ok(Some(delay.max(MIN_RETRY_DELAY)))
    }

    /// Record a terminal step event and wake the workflow.
    async fn finish_step(
        &self,
        message: &StepMessage,
        step: &Step,
        payload: EventPayload,
    ) -> Result<(), EngineError> {
        let record = match self
            .world
            .storage
            .create_event(
                Some(message.run_id),
                EventInput::new(payload).with_correlation(&message.step_id),
            )
            .await
        {
            Ok(record) => Some(record),
            // Already terminal (duplicate completion race, or the run
            // ended and this step was never in flight): the recorded
            // state stands.
            Err(err) if err.is_terminal_conflict() => {
                debug!(step = %step.step_name, "terminal event already recorded");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let wakeup_key = record
            .as_ref()
            .and_then(|r| r.event.as_ref())
            .map(|event| format!("wf:{}:{}", message.run_id, event.event_id))
            .unwrap_or_else(|| format!("wf:{}:settled:{}", message.run_id, message.step_id));
        self.wake_workflow(message, wakeup_key).await
    }

    async fn wake_workflow(
        &self,
        message: &StepMessage,
        idempotency_suffix: String,
    ) -> Result<(), EngineError> {
        let key = if idempotency_suffix.starts_with("wf:") {
            idempotency_suffix
        } else {
            format!("wf:{}:{}", message.run_id, idempotency_suffix)
        };
        enqueue_workflow(&self.world, &message.workflow_name, message.run_id, key).await
    }
}
