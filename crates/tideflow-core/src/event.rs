//! The append-only event log
//!
//! Events are the source of truth for a run: every entity field is a
//! projection of the events recorded for it. Events are immutable once
//! written and totally ordered within a run by their UUID v7 `event_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::SerialForm;
use crate::error::ErrorObject;

/// Event-schema version new runs are created under.
///
/// A run carries the spec version of its creation forever; the storage
/// layer gates every event against it.
pub const SPEC_VERSION: i32 = 2;

/// Payloads for every event type the engine records.
///
/// The tag doubles as the wire-level `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // =========================================================================
    // Run lifecycle
    // =========================================================================
    /// Run was created; storage allocates the run id
    RunCreated {
        workflow_name: String,
        deployment_id: Option<String>,
        input: SerialForm,
        execution_context: Option<SerialForm>,
    },

    /// Run was picked up by a worker for its first replay pass
    RunStarted,

    /// Workflow body returned
    RunCompleted { output: SerialForm },

    /// Workflow body failed fatally, or a step exhausted its retries
    RunFailed { error: ErrorObject },

    /// Run was cancelled; idempotent on an already-cancelled run
    RunCancelled,

    // =========================================================================
    // Step lifecycle
    // =========================================================================
    /// Step was materialized from a suspension
    StepCreated { step_name: String, input: SerialForm },

    /// One attempt of the step body began; increments `attempt`
    StepStarted,

    /// Step body returned; also valid straight from `pending`
    StepCompleted { output: SerialForm },

    /// Step failed terminally
    StepFailed { error: ErrorObject },

    /// Step failed and will be attempted again
    StepRetrying {
        error: ErrorObject,
        retry_after: Option<DateTime<Utc>>,
    },

    // =========================================================================
    // Hooks
    // =========================================================================
    /// Hook was created and its token bound
    HookCreated {
        token: String,
        metadata: Option<SerialForm>,
    },

    /// Hook creation hit a token already bound to a live hook
    HookConflict { token: String },

    /// External payload was delivered to the hook
    HookReceived { payload: SerialForm },

    /// Hook was disposed; its token is free again
    HookDisposed,

    // =========================================================================
    // Waits
    // =========================================================================
    /// Scheduled timeout that resumes the workflow at `resume_at`
    WaitCreated { resume_at: DateTime<Utc> },

    /// The wait elapsed and the workflow may proceed past it
    WaitCompleted,
}

impl EventPayload {
    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::RunStarted => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled => "run_cancelled",
            Self::StepCreated { .. } => "step_created",
            Self::StepStarted => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepRetrying { .. } => "step_retrying",
            Self::HookCreated { .. } => "hook_created",
            Self::HookConflict { .. } => "hook_conflict",
            Self::HookReceived { .. } => "hook_received",
            Self::HookDisposed => "hook_disposed",
            Self::WaitCreated { .. } => "wait_created",
            Self::WaitCompleted => "wait_completed",
        }
    }

    /// Whether this event moves a run to a terminal status
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled
        )
    }

    /// Whether this event records a terminal step outcome
    pub fn is_step_terminal(&self) -> bool {
        matches!(self, Self::StepCompleted { .. } | Self::StepFailed { .. })
    }
}

/// A recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// UUID v7: lexicographic, time-ordered within the run
    pub event_id: Uuid,

    pub run_id: Uuid,

    /// Step id, hook id, or wait id the event refers to
    pub correlation_id: Option<String>,

    /// Spec version of the run at the time of recording
    pub spec_version: i32,

    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Input to `WorkflowStore::create_event`
///
/// Storage assigns `event_id`, `created_at`, and the spec version; callers
/// provide the payload and the correlation target.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub payload: EventPayload,
    pub correlation_id: Option<String>,
}

impl EventInput {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_serialization_tag() {
        let payload = EventPayload::StepCompleted {
            output: SerialForm(json!({"value": 2})),
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"type\":\"step_completed\""));

        let parsed: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, parsed);
    }

    #[test]
    fn test_unit_variant_serialization() {
        let json = serde_json::to_string(&EventPayload::RunCancelled).unwrap();
        assert_eq!(json, "{\"type\":\"run_cancelled\"}");
    }

    #[test]
    fn test_event_envelope_flattens_payload() {
        let event = Event {
            event_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            correlation_id: Some("fetch#0".to_string()),
            spec_version: SPEC_VERSION,
            created_at: Utc::now(),
            payload: EventPayload::StepStarted,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step_started");
        assert_eq!(value["correlation_id"], "fetch#0");

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_event_type_names_match_catalog() {
        let samples = [
            (
                EventPayload::RunCreated {
                    workflow_name: "wf".into(),
                    deployment_id: None,
                    input: SerialForm(json!(null)),
                    execution_context: None,
                },
                "run_created",
            ),
            (EventPayload::RunStarted, "run_started"),
            (EventPayload::HookDisposed, "hook_disposed"),
            (EventPayload::WaitCompleted, "wait_completed"),
        ];

        for (payload, name) in samples {
            assert_eq!(payload.event_type(), name);
        }
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventPayload::RunCancelled.is_run_terminal());
        assert!(!EventPayload::RunStarted.is_run_terminal());
        assert!(EventPayload::StepFailed {
            error: ErrorObject::new("x")
        }
        .is_step_terminal());
        assert!(!EventPayload::StepStarted.is_step_terminal());
    }
}
