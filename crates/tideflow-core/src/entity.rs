//! Root entities: runs, steps, and hooks
//!
//! Entities are projections of the event log. Their fields are only ever
//! mutated by the storage layer, inside the same transaction that appends
//! the event describing the change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::SerialForm;
use crate::error::ErrorObject;

/// Scope shared by every entity a storage handle serves.
///
/// One storage handle is constructed for exactly one namespace, so
/// namespace-wide rules (hook token uniqueness, filesystem layout) hold
/// by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub owner: String,
    pub project: String,
    pub environment: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            owner: "default".to_string(),
            project: "default".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.project, self.environment)
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but not yet picked up by a worker
    Pending,

    /// Run body is executing or suspended on pending work
    Running,

    /// Run completed successfully
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses accept no further state-changing events
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One invocation of a workflow
///
/// Run ids are UUID v7: time-ordered and lexicographic, so listing by id
/// is listing by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub deployment_id: Option<String>,

    /// Event-schema version the run was created under; never changes
    pub spec_version: i32,

    pub status: RunStatus,

    /// Dehydrated workflow input
    pub input: SerialForm,

    /// Dehydrated workflow output (terminal successful runs only)
    pub output: Option<SerialForm>,

    pub error: Option<ErrorObject>,

    /// Opaque per-run globals made available to replay primitives
    pub execution_context: Option<SerialForm>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One logical step call inside a run
///
/// The `step_id` is the correlation id supplied by the replay context; it
/// is stable across re-executions of the workflow body and unique within
/// the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub run_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub input: SerialForm,
    pub output: Option<SerialForm>,
    pub error: Option<ErrorObject>,

    /// Number of `step_started` events recorded for this step
    pub attempt: u32,

    /// Earliest time the next attempt may start
    pub retry_after: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// An externally-addressable resume point
///
/// The token is unique among non-disposed hooks in the namespace;
/// disposing a hook frees its token for reuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub hook_id: String,
    pub run_id: Uuid,
    pub token: String,
    pub metadata: Option<SerialForm>,
    pub disposed: bool,
    pub created_at: DateTime<Utc>,
}

impl Hook {
    /// A hook is live until it is disposed
    pub fn is_live(&self) -> bool {
        !self.disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RunStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");

        let parsed: StepStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, StepStatus::Failed);
    }

    #[test]
    fn test_namespace_display() {
        let ns = Namespace::default();
        assert_eq!(ns.to_string(), "default/default/development");
    }
}
