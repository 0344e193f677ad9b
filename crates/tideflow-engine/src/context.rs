//! Replay context and the suspension protocol
//!
//! Each dispatcher pass installs a [`RunContext`] over the run's loaded
//! event log. Every replay primitive (`step`, `hook`, `sleep`) derives a
//! stable correlation id from its caller-supplied identity and positional
//! index, then either resolves immediately from a recorded terminal
//! outcome or registers a pending item and raises [`Interrupt::Suspend`].
//!
//! The primitive itself decides synchronously; the only async work in a
//! replay pass is storage and queue I/O around it. Suspension is a typed
//! result, never a panic: `Flow<T>` propagates through the workflow body
//! with `?` and the dispatcher short-circuits at the top.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use tideflow_core::{Codec, CodecError, ErrorObject, Event, EventPayload, SerialForm, SideEffects};

/// Engine-internal signal raised out of workflow bodies
#[derive(Debug)]
pub enum Interrupt {
    /// Pending work was discovered; the dispatcher materializes it
    Suspend,

    /// The run fails now (fatal user error or exhausted step)
    Fatal(ErrorObject),

    /// The run should be retried via queue redelivery
    Retryable(ErrorObject),
}

impl Interrupt {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(ErrorObject::new(message).with_kind("fatal"))
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(ErrorObject::new(message))
    }
}

impl From<CodecError> for Interrupt {
    fn from(err: CodecError) -> Self {
        Self::Fatal(ErrorObject::new(err.to_string()).with_kind("codec"))
    }
}

/// Result type of every replay primitive and workflow body
pub type Flow<T> = Result<T, Interrupt>;

/// Options for the hook primitive
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    /// Externally-addressable token; defaults to the hook id, which is
    /// stable across replays
    pub token: Option<String>,

    /// Opaque metadata stored on the hook entity
    pub metadata: Option<Value>,
}

/// Pending operation discovered during a replay pass
#[derive(Debug, Clone)]
pub enum PendingItem {
    Step {
        correlation_id: String,
        step_name: String,
        input: Value,
    },
    Hook {
        correlation_id: String,
        token: String,
        metadata: Option<Value>,
    },
    Wait {
        correlation_id: String,
        resume_at: DateTime<Utc>,
    },
}

impl PendingItem {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Step { correlation_id, .. }
            | Self::Hook { correlation_id, .. }
            | Self::Wait { correlation_id, .. } => correlation_id,
        }
    }
}

/// Recorded terminal outcome of a step
#[derive(Debug, Clone)]
enum StepOutcome {
    Completed(SerialForm),
    Failed(ErrorObject),
}

/// Index over the loaded event log, keyed by correlation id
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    step_outcomes: HashMap<String, StepOutcome>,
    hook_payloads: HashMap<String, SerialForm>,
    pub(crate) wait_created: HashMap<String, DateTime<Utc>>,
    pub(crate) wait_completed: std::collections::HashSet<String>,
}

impl LogIndex {
    pub(crate) fn build(events: &[Event]) -> Self {
        let mut index = Self::default();
        for event in events {
            let Some(correlation) = event.correlation_id.clone() else {
                continue;
            };
            match &event.payload {
                EventPayload::StepCompleted { output } => {
                    index
                        .step_outcomes
                        .insert(correlation, StepOutcome::Completed(output.clone()));
                }
                EventPayload::StepFailed { error } => {
                    index
                        .step_outcomes
                        .insert(correlation, StepOutcome::Failed(error.clone()));
                }
                EventPayload::HookReceived { payload } => {
                    // The first delivered payload is the one that resumes
                    // the primitive; later deliveries are observable via
                    // the event log.
                    index.hook_payloads.entry(correlation).or_insert_with(|| payload.clone());
                }
                EventPayload::WaitCreated { resume_at } => {
                    index.wait_created.insert(correlation, *resume_at);
                }
                EventPayload::WaitCompleted => {
                    index.wait_completed.insert(correlation);
                }
                _ => {}
            }
        }
        index
    }
}

/// Per-invocation replay context
///
/// Holds the event-log index, the positional counters that make
/// correlation ids stable, and the pending-invocation map (hash-keyed
/// for O(1) dedup by correlation id). One context serves exactly one
/// replay pass; counters reset with the next pass.
pub struct RunContext {
    run_id: Uuid,
    now: DateTime<Utc>,
    globals: Option<Value>,
    codec: Arc<dyn Codec>,
    log: LogIndex,
    counters: Mutex<HashMap<String, u32>>,
    invocations: Mutex<HashMap<String, PendingItem>>,
    ops: Mutex<SideEffects>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: Uuid,
        events: &[Event],
        codec: Arc<dyn Codec>,
        globals: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            now,
            globals,
            codec,
            log: LogIndex::build(events),
            counters: Mutex::new(HashMap::new()),
            invocations: Mutex::new(HashMap::new()),
            ops: Mutex::new(SideEffects::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The run's hydrated execution context
    pub fn globals(&self) -> Option<&Value> {
        self.globals.as_ref()
    }

    /// Execute (or replay) a named step.
    ///
    /// Resolves from the log when a terminal outcome exists; otherwise
    /// registers the step as pending and suspends. A step that failed
    /// terminally fails the run with the recorded error.
    pub fn step(&self, name: &str, input: Value) -> Flow<Value> {
        let correlation = self.next_correlation(name);
        match self.log.step_outcomes.get(&correlation) {
            Some(StepOutcome::Completed(output)) => self.hydrate(output),
            Some(StepOutcome::Failed(error)) => Err(Interrupt::Fatal(error.clone())),
            None => {
                self.pend(PendingItem::Step {
                    correlation_id: correlation,
                    step_name: name.to_string(),
                    input,
                });
                Err(Interrupt::Suspend)
            }
        }
    }

    /// Create (or replay) a hook and wait for its first payload.
    pub fn hook(&self, options: HookOptions) -> Flow<Value> {
        let index = self.next_index("hook");
        // Hook ids embed the run id so they are addressable without one.
        let correlation = format!("{}/hook#{}", self.run_id, index);
        match self.log.hook_payloads.get(&correlation) {
            Some(payload) => self.hydrate(payload),
            None => {
                let token = options.token.unwrap_or_else(|| correlation.clone());
                self.pend(PendingItem::Hook {
                    correlation_id: correlation,
                    token,
                    metadata: options.metadata,
                });
                Err(Interrupt::Suspend)
            }
        }
    }

    /// Suspend until `duration` has elapsed from the first pass that
    /// reached this point.
    pub fn sleep(&self, duration: Duration) -> Flow<()> {
        let resume_at = self.now + chrono::Duration::from_std(duration).unwrap_or_default();
        self.sleep_until(resume_at)
    }

    /// Suspend until an absolute time.
    ///
    /// Once a wait is recorded, its resume time is authoritative; the
    /// caller-supplied time only matters on the first pass.
    pub fn sleep_until(&self, resume_at: DateTime<Utc>) -> Flow<()> {
        let index = self.next_index("wait");
        let correlation = format!("wait#{index}");

        if self.log.wait_completed.contains(&correlation) {
            return Ok(());
        }

        let resume_at = self
            .log
            .wait_created
            .get(&correlation)
            .copied()
            .unwrap_or(resume_at);
        self.pend(PendingItem::Wait {
            correlation_id: correlation,
            resume_at,
        });
        Err(Interrupt::Suspend)
    }

    /// Drain the pending-invocation map
    pub(crate) fn take_invocations(&self) -> Vec<PendingItem> {
        self.invocations.lock().drain().map(|(_, item)| item).collect()
    }

    /// Drain hydration side effects collected during the pass
    pub(crate) fn take_ops(&self) -> SideEffects {
        std::mem::take(&mut *self.ops.lock())
    }

    fn next_index(&self, name: &str) -> u32 {
        let mut counters = self.counters.lock();
        let counter = counters.entry(name.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }

    fn next_correlation(&self, name: &str) -> String {
        format!("{}#{}", name, self.next_index(name))
    }

    fn pend(&self, item: PendingItem) {
        self.invocations
            .lock()
            .entry(item.correlation_id().to_string())
            .or_insert(item);
    }

    fn hydrate(&self, form: &SerialForm) -> Flow<Value> {
        let mut ops = self.ops.lock();
        Ok(self
            .codec
            .hydrate(form, &mut ops, self.run_id, self.globals.as_ref(), None)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideflow_core::{JsonCodec, SPEC_VERSION};

    fn event(run_id: Uuid, correlation: &str, payload: EventPayload) -> Event {
        Event {
            event_id: Uuid::now_v7(),
            run_id,
            correlation_id: Some(correlation.to_string()),
            spec_version: SPEC_VERSION,
            created_at: Utc::now(),
            payload,
        }
    }

    fn ctx(run_id: Uuid, events: &[Event]) -> RunContext {
        RunContext::new(run_id, events, Arc::new(JsonCodec::new()), None, Utc::now())
    }

    #[test]
    fn test_step_without_outcome_suspends() {
        let run_id = Uuid::now_v7();
        let ctx = ctx(run_id, &[]);

        let result = ctx.step("fetch", json!([1]));
        assert!(matches!(result, Err(Interrupt::Suspend)));

        let pending = ctx.take_invocations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id(), "fetch#0");
    }

    #[test]
    fn test_step_replays_completed_output() {
        let run_id = Uuid::now_v7();
        let events = [event(
            run_id,
            "fetch#0",
            EventPayload::StepCompleted {
                output: SerialForm(json!(42)),
            },
        )];
        let ctx = ctx(run_id, &events);

        let value = ctx.step("fetch", json!([])).unwrap();
        assert_eq!(value, json!(42));
        assert!(ctx.take_invocations().is_empty());
    }

    #[test]
    fn test_step_replays_failure_as_fatal() {
        let run_id = Uuid::now_v7();
        let events = [event(
            run_id,
            "fetch#0",
            EventPayload::StepFailed {
                error: ErrorObject::new("step \"fetch\" failed after 2 retries: boom"),
            },
        )];
        let ctx = ctx(run_id, &events);

        match ctx.step("fetch", json!([])) {
            Err(Interrupt::Fatal(error)) => {
                assert!(error.message.contains("after 2 retries"));
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn test_positional_counters_disambiguate_same_name() {
        let run_id = Uuid::now_v7();
        let events = [event(
            run_id,
            "inc#0",
            EventPayload::StepCompleted {
                output: SerialForm(json!(1)),
            },
        )];
        let ctx = ctx(run_id, &events);

        // First call replays; the second one is a fresh correlation.
        assert_eq!(ctx.step("inc", json!([])).unwrap(), json!(1));
        assert!(matches!(ctx.step("inc", json!([])), Err(Interrupt::Suspend)));

        let pending = ctx.take_invocations();
        assert_eq!(pending[0].correlation_id(), "inc#1");
    }

    #[test]
    fn test_pending_map_dedups_by_correlation() {
        let run_id = Uuid::now_v7();
        let ctx = ctx(run_id, &[]);

        // Two passes over the same primitive in one context cannot
        // happen, but a duplicate insert must be a no-op.
        let _ = ctx.step("fetch", json!([1]));
        ctx.pend(PendingItem::Step {
            correlation_id: "fetch#0".to_string(),
            step_name: "fetch".to_string(),
            input: json!([999]),
        });

        let pending = ctx.take_invocations();
        assert_eq!(pending.len(), 1);
        match &pending[0] {
            PendingItem::Step { input, .. } => assert_eq!(*input, json!([1])),
            other => panic!("expected step, got {other:?}"),
        }
    }

    #[test]
    fn test_hook_replays_first_payload() {
        let run_id = Uuid::now_v7();
        let correlation = format!("{run_id}/hook#0");
        let events = [
            event(
                run_id,
                &correlation,
                EventPayload::HookReceived {
                    payload: SerialForm(json!("first")),
                },
            ),
            event(
                run_id,
                &correlation,
                EventPayload::HookReceived {
                    payload: SerialForm(json!("second")),
                },
            ),
        ];
        let ctx = ctx(run_id, &events);

        let value = ctx.hook(HookOptions::default()).unwrap();
        assert_eq!(value, json!("first"));
    }

    #[test]
    fn test_hook_default_token_is_stable() {
        let run_id = Uuid::now_v7();
        let ctx1 = ctx(run_id, &[]);
        let ctx2 = ctx(run_id, &[]);

        let _ = ctx1.hook(HookOptions::default());
        let _ = ctx2.hook(HookOptions::default());

        let token = |items: Vec<PendingItem>| match items.into_iter().next().unwrap() {
            PendingItem::Hook { token, .. } => token,
            other => panic!("expected hook, got {other:?}"),
        };
        assert_eq!(token(ctx1.take_invocations()), token(ctx2.take_invocations()));
    }

    #[test]
    fn test_sleep_uses_recorded_resume_time() {
        let run_id = Uuid::now_v7();
        let recorded = Utc::now() + chrono::Duration::seconds(30);
        let events = [event(
            run_id,
            "wait#0",
            EventPayload::WaitCreated { resume_at: recorded },
        )];
        let ctx = ctx(run_id, &events);

        let result = ctx.sleep(Duration::from_secs(9999));
        assert!(matches!(result, Err(Interrupt::Suspend)));

        let pending = ctx.take_invocations();
        match &pending[0] {
            PendingItem::Wait { resume_at, .. } => assert_eq!(*resume_at, recorded),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn test_completed_wait_replays() {
        let run_id = Uuid::now_v7();
        let events = [
            event(
                run_id,
                "wait#0",
                EventPayload::WaitCreated {
                    resume_at: Utc::now(),
                },
            ),
            event(run_id, "wait#0", EventPayload::WaitCompleted),
        ];
        let ctx = ctx(run_id, &events);

        assert!(ctx.sleep(Duration::from_secs(1)).is_ok());
        assert!(ctx.take_invocations().is_empty());
    }
}
