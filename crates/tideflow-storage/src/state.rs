//! Entity state machines and event projection
//!
//! Everything here is pure: [`transition`] decides whether a run accepts
//! an event and what the projected entities look like afterwards, and
//! [`fold_events`] rebuilds a run's entities from its log. Both paths go
//! through the same per-event mutators, so a stored entity is always the
//! fold of its events.
//!
//! Backends own persistence and locking; they never interpret events
//! themselves.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tideflow_core::{
    Event, EventInput, EventPayload, Hook, Run, RunStatus, Step, StepStatus, SPEC_VERSION,
};

use crate::store::StoreError;

/// Projection of a wait (not an entity; tracked for correlation checks)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    pub wait_id: String,
    pub resume_at: DateTime<Utc>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Full projected state of one run
#[derive(Debug, Clone)]
pub struct RunProjection {
    pub run: Run,
    pub steps: HashMap<String, Step>,
    pub hooks: HashMap<String, Hook>,
    pub waits: HashMap<String, WaitState>,
    pub events: Vec<Event>,
}

/// Snapshot of the correlation target an event refers to
#[derive(Debug, Clone)]
pub enum Target {
    None,
    Step(Step),
    Hook(Hook),
    Wait(WaitState),
}

impl Target {
    fn step(&self) -> Option<&Step> {
        match self {
            Self::Step(step) => Some(step),
            _ => None,
        }
    }

    fn hook(&self) -> Option<&Hook> {
        match self {
            Self::Hook(hook) => Some(hook),
            _ => None,
        }
    }

    fn wait(&self) -> Option<&WaitState> {
        match self {
            Self::Wait(wait) => Some(wait),
            _ => None,
        }
    }
}

/// Per-call context supplied by the backend
#[derive(Debug, Clone)]
pub struct ApplyCtx {
    pub now: DateTime<Utc>,
    pub event_id: Uuid,

    /// For `hook_created`: the token is already bound to another live hook
    pub token_bound_elsewhere: bool,
}

/// Token index mutation the backend must apply with the transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOp {
    Bind { token: String, hook_id: String },
    Release { token: String },
}

/// Outcome of a validated event
#[derive(Debug, Clone)]
pub struct Transition {
    /// Event to append; `None` for idempotent no-ops and legacy status
    /// updates
    pub event: Option<Event>,

    /// Run entity after the event
    pub run: Run,

    pub step: Option<Step>,
    pub hook: Option<Hook>,
    pub wait: Option<WaitState>,

    /// Run went terminal: the backend disposes every live hook of the
    /// run and releases their tokens
    pub dispose_hooks: bool,

    pub token_op: Option<TokenOp>,
}

impl Transition {
    fn recorded(event: Event, run: Run) -> Self {
        Self {
            event: Some(event),
            run,
            step: None,
            hook: None,
            wait: None,
            dispose_hooks: false,
            token_op: None,
        }
    }

    fn noop(run: Run) -> Self {
        Self {
            event: None,
            run,
            step: None,
            hook: None,
            wait: None,
            dispose_hooks: false,
            token_op: None,
        }
    }
}

fn build_event(
    run_id: Uuid,
    spec_version: i32,
    input: &EventInput,
    ctx: &ApplyCtx,
) -> Event {
    Event {
        event_id: ctx.event_id,
        run_id,
        correlation_id: input.correlation_id.clone(),
        spec_version,
        created_at: ctx.now,
        payload: input.payload.clone(),
    }
}

fn require_correlation(input: &EventInput) -> Result<&str, StoreError> {
    input.correlation_id.as_deref().ok_or_else(|| {
        StoreError::InvalidInput(format!(
            "{} requires a correlation id",
            input.payload.event_type()
        ))
    })
}

// =============================================================================
// Creation and per-event mutators (shared by transition and fold)
// =============================================================================

fn run_from_created(event: &Event) -> Result<Run, StoreError> {
    match &event.payload {
        EventPayload::RunCreated {
            workflow_name,
            deployment_id,
            input,
            execution_context,
        } => Ok(Run {
            run_id: event.run_id,
            workflow_name: workflow_name.clone(),
            deployment_id: deployment_id.clone(),
            spec_version: event.spec_version,
            status: RunStatus::Pending,
            input: input.clone(),
            output: None,
            error: None,
            execution_context: execution_context.clone(),
            created_at: event.created_at,
            started_at: None,
            completed_at: None,
            updated_at: event.created_at,
        }),
        other => Err(StoreError::InvalidInput(format!(
            "expected run_created, got {}",
            other.event_type()
        ))),
    }
}

fn apply_to_run(run: &mut Run, payload: &EventPayload, at: DateTime<Utc>) {
    match payload {
        EventPayload::RunStarted => {
            run.status = RunStatus::Running;
            run.started_at = Some(at);
        }
        EventPayload::RunCompleted { output } => {
            run.status = RunStatus::Completed;
            run.output = Some(output.clone());
            run.completed_at = Some(at);
        }
        EventPayload::RunFailed { error } => {
            run.status = RunStatus::Failed;
            run.error = Some(error.clone());
            run.completed_at = Some(at);
        }
        EventPayload::RunCancelled => {
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(at);
        }
        _ => {}
    }
    run.updated_at = at;
}

fn step_from_created(
    run_id: Uuid,
    step_id: &str,
    payload: &EventPayload,
    at: DateTime<Utc>,
) -> Option<Step> {
    match payload {
        EventPayload::StepCreated { step_name, input } => Some(Step {
            run_id,
            step_id: step_id.to_string(),
            step_name: step_name.clone(),
            status: StepStatus::Pending,
            input: input.clone(),
            output: None,
            error: None,
            attempt: 0,
            retry_after: None,
            created_at: at,
            started_at: None,
            completed_at: None,
            updated_at: at,
        }),
        _ => None,
    }
}

fn apply_to_step(step: &mut Step, payload: &EventPayload, at: DateTime<Utc>) {
    match payload {
        EventPayload::StepStarted => {
            step.status = StepStatus::Running;
            step.attempt += 1;
            step.retry_after = None;
            if step.started_at.is_none() {
                step.started_at = Some(at);
            }
        }
        EventPayload::StepCompleted { output } => {
            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            step.retry_after = None;
            step.completed_at = Some(at);
        }
        EventPayload::StepFailed { error } => {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            step.retry_after = None;
            step.completed_at = Some(at);
        }
        EventPayload::StepRetrying { error, retry_after } => {
            step.status = StepStatus::Pending;
            step.error = Some(error.clone());
            step.retry_after = *retry_after;
        }
        _ => {}
    }
    step.updated_at = at;
}

fn hook_from_created(
    run_id: Uuid,
    hook_id: &str,
    payload: &EventPayload,
    at: DateTime<Utc>,
) -> Option<Hook> {
    match payload {
        EventPayload::HookCreated { token, metadata } => Some(Hook {
            hook_id: hook_id.to_string(),
            run_id,
            token: token.clone(),
            metadata: metadata.clone(),
            disposed: false,
            created_at: at,
        }),
        _ => None,
    }
}

// =============================================================================
// Validation + transition
// =============================================================================

/// Validate and project a `run_created` event.
pub fn create_run(
    run_id: Uuid,
    input: &EventInput,
    ctx: &ApplyCtx,
) -> Result<(Event, Run), StoreError> {
    if !matches!(input.payload, EventPayload::RunCreated { .. }) {
        return Err(StoreError::InvalidInput(format!(
            "{} requires an existing run id",
            input.payload.event_type()
        )));
    }

    let event = build_event(run_id, SPEC_VERSION, input, ctx);
    let run = run_from_created(&event)?;
    Ok((event, run))
}

/// Validate an event against the current run state and compute the
/// projected entities.
///
/// `target` is the snapshot of the correlation target (step, hook, or
/// wait) the event refers to, or `Target::None` when it does not exist.
pub fn transition(
    run: &Run,
    target: Target,
    input: &EventInput,
    ctx: &ApplyCtx,
) -> Result<Transition, StoreError> {
    // Spec-version gate first: a run created under a newer spec rejects
    // everything; an older run gets the legacy allow-list.
    if run.spec_version > SPEC_VERSION {
        return Err(StoreError::VersionMismatch {
            required: run.spec_version,
        });
    }
    if run.spec_version < SPEC_VERSION {
        return legacy_transition(run, input, ctx);
    }

    let payload = &input.payload;
    match payload {
        EventPayload::RunCreated { .. } => Err(StoreError::duplicate(format!(
            "run {} already exists",
            run.run_id
        ))),

        EventPayload::RunStarted => match run.status {
            RunStatus::Pending => {
                let event = build_event(run.run_id, run.spec_version, input, ctx);
                let mut after = run.clone();
                apply_to_run(&mut after, payload, ctx.now);
                Ok(Transition::recorded(event, after))
            }
            RunStatus::Running => Err(StoreError::state(format!(
                "run {} already started",
                run.run_id
            ))),
            _ => Err(StoreError::terminal(format!(
                "run {} is {}",
                run.run_id, run.status
            ))),
        },

        EventPayload::RunCompleted { .. } | EventPayload::RunFailed { .. } => match run.status {
            RunStatus::Running => {
                let event = build_event(run.run_id, run.spec_version, input, ctx);
                let mut after = run.clone();
                apply_to_run(&mut after, payload, ctx.now);
                Ok(Transition {
                    dispose_hooks: true,
                    ..Transition::recorded(event, after)
                })
            }
            RunStatus::Pending => Err(StoreError::state(format!(
                "run {} has not started",
                run.run_id
            ))),
            _ => Err(StoreError::terminal(format!(
                "run {} is {}",
                run.run_id, run.status
            ))),
        },

        EventPayload::RunCancelled => match run.status {
            RunStatus::Pending | RunStatus::Running => {
                let event = build_event(run.run_id, run.spec_version, input, ctx);
                let mut after = run.clone();
                apply_to_run(&mut after, payload, ctx.now);
                Ok(Transition {
                    dispose_hooks: true,
                    ..Transition::recorded(event, after)
                })
            }
            // Repeated cancellation returns the existing state and emits
            // no event.
            RunStatus::Cancelled => Ok(Transition::noop(run.clone())),
            _ => Err(StoreError::terminal(format!(
                "run {} is {}",
                run.run_id, run.status
            ))),
        },

        EventPayload::StepCreated { .. } => {
            let step_id = require_correlation(input)?;
            if run.status.is_terminal() {
                return Err(StoreError::terminal(format!(
                    "cannot create step on {} run {}",
                    run.status, run.run_id
                )));
            }
            if target.step().is_some() {
                return Err(StoreError::duplicate(format!(
                    "step {step_id} already exists in run {}",
                    run.run_id
                )));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let step = step_from_created(run.run_id, step_id, payload, ctx.now);
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                step,
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::StepStarted => {
            let step_id = require_correlation(input)?;
            let step = target
                .step()
                .ok_or_else(|| StoreError::not_found(format!("step {step_id}")))?;

            if step.status.is_terminal() {
                return Err(StoreError::terminal(format!("step {step_id} is {}", step.status)));
            }
            if run.status.is_terminal() {
                return Err(StoreError::terminal(format!(
                    "cannot start step {step_id} on {} run {}",
                    run.status, run.run_id
                )));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let mut after_step = step.clone();
            apply_to_step(&mut after_step, payload, ctx.now);
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                step: Some(after_step),
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::StepCompleted { .. } | EventPayload::StepFailed { .. } => {
            let step_id = require_correlation(input)?;
            let step = target
                .step()
                .ok_or_else(|| StoreError::not_found(format!("step {step_id}")))?;

            if step.status.is_terminal() {
                return Err(StoreError::terminal(format!("step {step_id} is {}", step.status)));
            }
            // A step that was in flight when the run went terminal still
            // records its result; a step that never started does not.
            if run.status.is_terminal() && step.status != StepStatus::Running {
                return Err(StoreError::terminal(format!(
                    "step {step_id} was not in flight on {} run {}",
                    run.status, run.run_id
                )));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let mut after_step = step.clone();
            apply_to_step(&mut after_step, payload, ctx.now);
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                step: Some(after_step),
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::StepRetrying { .. } => {
            let step_id = require_correlation(input)?;
            let step = target
                .step()
                .ok_or_else(|| StoreError::not_found(format!("step {step_id}")))?;

            if step.status.is_terminal() {
                return Err(StoreError::terminal(format!("step {step_id} is {}", step.status)));
            }
            if run.status.is_terminal() {
                return Err(StoreError::terminal(format!(
                    "cannot retry step {step_id} on {} run {}",
                    run.status, run.run_id
                )));
            }
            if step.status != StepStatus::Running {
                return Err(StoreError::state(format!(
                    "step {step_id} is {} (retrying requires running)",
                    step.status
                )));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let mut after_step = step.clone();
            apply_to_step(&mut after_step, payload, ctx.now);
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                step: Some(after_step),
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::HookCreated { token, .. } => {
            let hook_id = require_correlation(input)?;
            if run.status.is_terminal() {
                return Err(StoreError::terminal(format!(
                    "cannot create hook on {} run {}",
                    run.status, run.run_id
                )));
            }
            if target.hook().is_some() {
                return Err(StoreError::duplicate(format!("hook {hook_id} already exists")));
            }

            // Token collision is not an error: a hook_conflict event is
            // recorded instead and no hook entity is produced.
            if ctx.token_bound_elsewhere {
                let conflict = EventInput::new(EventPayload::HookConflict {
                    token: token.clone(),
                })
                .with_correlation(hook_id);
                let event = build_event(run.run_id, run.spec_version, &conflict, ctx);
                let mut after = run.clone();
                after.updated_at = ctx.now;
                return Ok(Transition::recorded(event, after));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let hook = hook_from_created(run.run_id, hook_id, payload, ctx.now);
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                hook: hook.clone(),
                token_op: hook.map(|h| TokenOp::Bind {
                    token: h.token,
                    hook_id: h.hook_id,
                }),
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::HookConflict { .. } => Err(StoreError::InvalidInput(
            "hook_conflict is storage-generated".to_string(),
        )),

        EventPayload::HookReceived { .. } => {
            let hook_id = require_correlation(input)?;
            let hook = target
                .hook()
                .ok_or_else(|| StoreError::not_found(format!("hook {hook_id}")))?;
            // Disposed is the hook's terminal state; the run may still
            // be live, so this is not `Gone`.
            if hook.disposed {
                return Err(StoreError::terminal(format!("hook {hook_id} is disposed")));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition::recorded(event, after))
        }

        EventPayload::HookDisposed => {
            let hook_id = require_correlation(input)?;
            let hook = target
                .hook()
                .ok_or_else(|| StoreError::not_found(format!("hook {hook_id}")))?;
            if hook.disposed {
                return Err(StoreError::terminal(format!("hook {hook_id} already disposed")));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let mut after_hook = hook.clone();
            after_hook.disposed = true;
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                hook: Some(after_hook.clone()),
                token_op: Some(TokenOp::Release {
                    token: after_hook.token,
                }),
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::WaitCreated { resume_at } => {
            let wait_id = require_correlation(input)?;
            if run.status.is_terminal() {
                return Err(StoreError::terminal(format!(
                    "cannot create wait on {} run {}",
                    run.status, run.run_id
                )));
            }
            if target.wait().is_some() {
                return Err(StoreError::duplicate(format!("wait {wait_id} already exists")));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let wait = WaitState {
                wait_id: wait_id.to_string(),
                resume_at: *resume_at,
                completed: false,
                created_at: ctx.now,
            };
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                wait: Some(wait),
                ..Transition::recorded(event, after)
            })
        }

        EventPayload::WaitCompleted => {
            let wait_id = require_correlation(input)?;
            let wait = target
                .wait()
                .ok_or_else(|| StoreError::not_found(format!("wait {wait_id}")))?;
            if wait.completed {
                return Err(StoreError::duplicate(format!("wait {wait_id} already completed")));
            }

            let event = build_event(run.run_id, run.spec_version, input, ctx);
            let mut after_wait = wait.clone();
            after_wait.completed = true;
            let mut after = run.clone();
            after.updated_at = ctx.now;
            Ok(Transition {
                wait: Some(after_wait),
                ..Transition::recorded(event, after)
            })
        }
    }
}

/// Legacy allow-list: `run_cancelled` updates status without an event;
/// `wait_completed` and `hook_received` are recorded with no entity
/// mutation; everything else is rejected.
fn legacy_transition(
    run: &Run,
    input: &EventInput,
    ctx: &ApplyCtx,
) -> Result<Transition, StoreError> {
    match &input.payload {
        EventPayload::RunCancelled => {
            let mut after = run.clone();
            if after.status != RunStatus::Cancelled {
                apply_to_run(&mut after, &input.payload, ctx.now);
            }
            Ok(Transition::noop(after))
        }
        EventPayload::WaitCompleted | EventPayload::HookReceived { .. } => {
            let event = build_event(run.run_id, run.spec_version, input, ctx);
            Ok(Transition::recorded(event, run.clone()))
        }
        other => Err(StoreError::LegacyUnsupported {
            event_type: other.event_type().to_string(),
        }),
    }
}

// =============================================================================
// Fold (projection rebuild)
// =============================================================================

/// Apply one recorded event to a projection. Used for rebuilds; assumes
/// the event was accepted by [`transition`] when it was recorded.
pub fn project_event(proj: &mut RunProjection, event: &Event) {
    let at = event.created_at;
    let correlation = event.correlation_id.as_deref().unwrap_or_default();

    match &event.payload {
        EventPayload::RunCreated { .. } => {}
        EventPayload::RunStarted
        | EventPayload::RunCompleted { .. }
        | EventPayload::RunFailed { .. }
        | EventPayload::RunCancelled => {
            apply_to_run(&mut proj.run, &event.payload, at);
            if event.payload.is_run_terminal() {
                for hook in proj.hooks.values_mut() {
                    hook.disposed = true;
                }
            }
        }

        EventPayload::StepCreated { .. } => {
            if let Some(step) = step_from_created(proj.run.run_id, correlation, &event.payload, at)
            {
                proj.steps.insert(correlation.to_string(), step);
            }
            proj.run.updated_at = at;
        }
        EventPayload::StepStarted
        | EventPayload::StepCompleted { .. }
        | EventPayload::StepFailed { .. }
        | EventPayload::StepRetrying { .. } => {
            if let Some(step) = proj.steps.get_mut(correlation) {
                apply_to_step(step, &event.payload, at);
            }
            proj.run.updated_at = at;
        }

        EventPayload::HookCreated { .. } => {
            if let Some(hook) = hook_from_created(proj.run.run_id, correlation, &event.payload, at)
            {
                proj.hooks.insert(correlation.to_string(), hook);
            }
            proj.run.updated_at = at;
        }
        EventPayload::HookDisposed => {
            if let Some(hook) = proj.hooks.get_mut(correlation) {
                hook.disposed = true;
            }
            proj.run.updated_at = at;
        }
        EventPayload::HookConflict { .. } | EventPayload::HookReceived { .. } => {
            proj.run.updated_at = at;
        }

        EventPayload::WaitCreated { resume_at } => {
            proj.waits.insert(
                correlation.to_string(),
                WaitState {
                    wait_id: correlation.to_string(),
                    resume_at: *resume_at,
                    completed: false,
                    created_at: at,
                },
            );
            proj.run.updated_at = at;
        }
        EventPayload::WaitCompleted => {
            if let Some(wait) = proj.waits.get_mut(correlation) {
                wait.completed = true;
            }
            proj.run.updated_at = at;
        }
    }
}

/// Rebuild a run's entities by folding its event log in order.
pub fn fold_events(events: &[Event]) -> Result<RunProjection, StoreError> {
    let first = events
        .first()
        .ok_or_else(|| StoreError::InvalidInput("empty event log".to_string()))?;
    let run = run_from_created(first)?;

    let mut proj = RunProjection {
        run,
        steps: HashMap::new(),
        hooks: HashMap::new(),
        waits: HashMap::new(),
        events: Vec::new(),
    };

    for event in &events[1..] {
        project_event(&mut proj, event);
    }
    proj.events = events.to_vec();

    Ok(proj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideflow_core::{ErrorObject, SerialForm};

    fn ctx() -> ApplyCtx {
        ApplyCtx {
            now: Utc::now(),
            event_id: Uuid::now_v7(),
            token_bound_elsewhere: false,
        }
    }

    fn created_input() -> EventInput {
        EventInput::new(EventPayload::RunCreated {
            workflow_name: "order".to_string(),
            deployment_id: None,
            input: SerialForm(json!([1])),
            execution_context: None,
        })
    }

    fn running_run() -> Run {
        let (_, mut run) = create_run(Uuid::now_v7(), &created_input(), &ctx()).unwrap();
        run.status = RunStatus::Running;
        run
    }

    fn pending_step(run: &Run, step_id: &str) -> Step {
        let input = EventInput::new(EventPayload::StepCreated {
            step_name: "fetch".to_string(),
            input: SerialForm(json!([])),
        })
        .with_correlation(step_id);
        let t = transition(run, Target::None, &input, &ctx()).unwrap();
        t.step.unwrap()
    }

    #[test]
    fn test_create_run_projects_pending() {
        let (event, run) = create_run(Uuid::now_v7(), &created_input(), &ctx()).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.spec_version, SPEC_VERSION);
        assert_eq!(event.payload.event_type(), "run_created");
        assert_eq!(event.run_id, run.run_id);
    }

    #[test]
    fn test_run_lifecycle_happy_path() {
        let (_, run) = create_run(Uuid::now_v7(), &created_input(), &ctx()).unwrap();

        let started = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunStarted),
            &ctx(),
        )
        .unwrap();
        assert_eq!(started.run.status, RunStatus::Running);
        assert!(started.run.started_at.is_some());

        let completed = transition(
            &started.run,
            Target::None,
            &EventInput::new(EventPayload::RunCompleted {
                output: SerialForm(json!(2)),
            }),
            &ctx(),
        )
        .unwrap();
        assert_eq!(completed.run.status, RunStatus::Completed);
        assert!(completed.run.completed_at.is_some());
        assert!(completed.dispose_hooks);
    }

    #[test]
    fn test_terminal_run_rejects_state_changes() {
        let mut run = running_run();
        run.status = RunStatus::Completed;

        let err = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunStarted),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_terminal_conflict());

        let err = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunCancelled),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_terminal_conflict());
    }

    #[test]
    fn test_repeated_cancel_is_idempotent_and_silent() {
        let run = running_run();
        let cancelled = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunCancelled),
            &ctx(),
        )
        .unwrap();
        assert!(cancelled.event.is_some());

        let again = transition(
            &cancelled.run,
            Target::None,
            &EventInput::new(EventPayload::RunCancelled),
            &ctx(),
        )
        .unwrap();
        assert!(again.event.is_none());
        assert_eq!(again.run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_step_attempt_incremented_only_by_started() {
        let run = running_run();
        let step = pending_step(&run, "fetch#0");
        assert_eq!(step.attempt, 0);

        let started = transition(
            &run,
            Target::Step(step),
            &EventInput::new(EventPayload::StepStarted).with_correlation("fetch#0"),
            &ctx(),
        )
        .unwrap();
        let step = started.step.unwrap();
        assert_eq!(step.attempt, 1);
        assert_eq!(step.status, StepStatus::Running);

        let retrying = transition(
            &run,
            Target::Step(step),
            &EventInput::new(EventPayload::StepRetrying {
                error: ErrorObject::new("boom"),
                retry_after: None,
            })
            .with_correlation("fetch#0"),
            &ctx(),
        )
        .unwrap();
        let step = retrying.step.unwrap();
        assert_eq!(step.attempt, 1);
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn test_step_instant_completion_from_pending() {
        let run = running_run();
        let step = pending_step(&run, "fetch#0");

        let completed = transition(
            &run,
            Target::Step(step),
            &EventInput::new(EventPayload::StepCompleted {
                output: SerialForm(json!(1)),
            })
            .with_correlation("fetch#0"),
            &ctx(),
        )
        .unwrap();
        assert_eq!(completed.step.unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn test_terminal_step_accepts_nothing() {
        let run = running_run();
        let mut step = pending_step(&run, "fetch#0");
        step.status = StepStatus::Completed;

        for payload in [
            EventPayload::StepStarted,
            EventPayload::StepCompleted {
                output: SerialForm(json!(1)),
            },
            EventPayload::StepFailed {
                error: ErrorObject::new("x"),
            },
        ] {
            let err = transition(
                &run,
                Target::Step(step.clone()),
                &EventInput::new(payload).with_correlation("fetch#0"),
                &ctx(),
            )
            .unwrap_err();
            assert!(err.is_terminal_conflict());
        }
    }

    #[test]
    fn test_cancelled_run_step_asymmetry() {
        // In-flight steps record their result on a terminal run; pending
        // steps cannot start or complete.
        let run = running_run();
        let pending = pending_step(&run, "a#0");
        let mut in_flight = pending_step(&run, "b#0");
        in_flight.status = StepStatus::Running;
        in_flight.attempt = 1;

        let mut cancelled = run.clone();
        cancelled.status = RunStatus::Cancelled;

        let ok = transition(
            &cancelled,
            Target::Step(in_flight),
            &EventInput::new(EventPayload::StepCompleted {
                output: SerialForm(json!("late")),
            })
            .with_correlation("b#0"),
            &ctx(),
        );
        assert!(ok.is_ok());

        let err = transition(
            &cancelled,
            Target::Step(pending.clone()),
            &EventInput::new(EventPayload::StepStarted).with_correlation("a#0"),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_terminal_conflict());

        let err = transition(
            &cancelled,
            Target::Step(pending),
            &EventInput::new(EventPayload::StepCompleted {
                output: SerialForm(json!(1)),
            })
            .with_correlation("a#0"),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_terminal_conflict());

        let err = transition(
            &cancelled,
            Target::None,
            &EventInput::new(EventPayload::StepCreated {
                step_name: "new".to_string(),
                input: SerialForm(json!([])),
            })
            .with_correlation("c#0"),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_terminal_conflict());
    }

    #[test]
    fn test_hook_token_collision_records_conflict_event() {
        let run = running_run();
        let collision = ApplyCtx {
            token_bound_elsewhere: true,
            ..ctx()
        };

        let t = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::HookCreated {
                token: "t".to_string(),
                metadata: None,
            })
            .with_correlation("hook#0"),
            &collision,
        )
        .unwrap();

        let event = t.event.unwrap();
        assert_eq!(event.payload.event_type(), "hook_conflict");
        assert!(t.hook.is_none());
        assert!(t.token_op.is_none());
    }

    #[test]
    fn test_hook_dispose_releases_token() {
        let run = running_run();
        let created = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::HookCreated {
                token: "t".to_string(),
                metadata: None,
            })
            .with_correlation("hook#0"),
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            created.token_op,
            Some(TokenOp::Bind {
                token: "t".to_string(),
                hook_id: "hook#0".to_string()
            })
        );

        let hook = created.hook.unwrap();
        let disposed = transition(
            &run,
            Target::Hook(hook),
            &EventInput::new(EventPayload::HookDisposed).with_correlation("hook#0"),
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            disposed.token_op,
            Some(TokenOp::Release {
                token: "t".to_string()
            })
        );
        assert!(disposed.hook.unwrap().disposed);
    }

    #[test]
    fn test_received_on_disposed_hook_is_terminal_conflict() {
        let run = running_run();
        let created = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::HookCreated {
                token: "t".to_string(),
                metadata: None,
            })
            .with_correlation("hook#0"),
            &ctx(),
        )
        .unwrap();
        let mut hook = created.hook.unwrap();
        hook.disposed = true;

        // The run is still running; the hook alone is terminal.
        let err = transition(
            &run,
            Target::Hook(hook),
            &EventInput::new(EventPayload::HookReceived {
                payload: SerialForm(json!("late")),
            })
            .with_correlation("hook#0"),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.is_terminal_conflict());
    }

    #[test]
    fn test_legacy_run_gate() {
        let mut run = running_run();
        run.spec_version = 1;

        let err = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunStarted),
            &ctx(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not supported for legacy runs"));

        // run_cancelled updates status without recording an event.
        let cancelled = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunCancelled),
            &ctx(),
        )
        .unwrap();
        assert!(cancelled.event.is_none());
        assert_eq!(cancelled.run.status, RunStatus::Cancelled);

        // wait_completed is recorded with no entity mutation.
        let recorded = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::WaitCompleted).with_correlation("wait#0"),
            &ctx(),
        )
        .unwrap();
        assert!(recorded.event.is_some());
        assert_eq!(recorded.run.status, run.status);
    }

    #[test]
    fn test_future_spec_rejected() {
        let mut run = running_run();
        run.spec_version = SPEC_VERSION + 1;

        let err = transition(
            &run,
            Target::None,
            &EventInput::new(EventPayload::RunStarted),
            &ctx(),
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains(&format!("requires spec version {}", SPEC_VERSION + 1)));
    }

    #[test]
    fn test_fold_matches_transitions() {
        // Drive a run through a full lifecycle via transition(), then
        // fold the recorded events and compare entities.
        let mut events = Vec::new();
        let (event, mut run) = create_run(Uuid::now_v7(), &created_input(), &ctx()).unwrap();
        events.push(event);

        let mut record = |run: &mut Run, target: Target, input: EventInput| -> Transition {
            let t = transition(run, target, &input, &ctx()).unwrap();
            if let Some(event) = &t.event {
                events.push(event.clone());
            }
            *run = t.run.clone();
            t
        };

        record(&mut run, Target::None, EventInput::new(EventPayload::RunStarted));
        let t = record(
            &mut run,
            Target::None,
            EventInput::new(EventPayload::StepCreated {
                step_name: "fetch".to_string(),
                input: SerialForm(json!([1])),
            })
            .with_correlation("fetch#0"),
        );
        let step = t.step.unwrap();
        let t = record(
            &mut run,
            Target::Step(step),
            EventInput::new(EventPayload::StepStarted).with_correlation("fetch#0"),
        );
        let step = t.step.unwrap();
        let t = record(
            &mut run,
            Target::Step(step),
            EventInput::new(EventPayload::StepCompleted {
                output: SerialForm(json!(1)),
            })
            .with_correlation("fetch#0"),
        );
        let final_step = t.step.unwrap();
        record(
            &mut run,
            Target::None,
            EventInput::new(EventPayload::RunCompleted {
                output: SerialForm(json!(1)),
            }),
        );

        let folded = fold_events(&events).unwrap();
        assert_eq!(folded.run.status, run.status);
        assert_eq!(folded.run.output, run.output);
        assert_eq!(folded.run.completed_at, run.completed_at);
        assert_eq!(folded.steps["fetch#0"].status, final_step.status);
        assert_eq!(folded.steps["fetch#0"].attempt, final_step.attempt);
        assert_eq!(folded.steps["fetch#0"].output, final_step.output);
    }
}
