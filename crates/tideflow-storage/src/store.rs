//! WorkflowStore trait definition

use async_trait::async_trait;
use uuid::Uuid;

use tideflow_core::{
    Event, EventInput, Hook, Namespace, Page, PageRequest, Run, RunStatus, SortOrder, Step,
};

/// Conflict classification carried by [`StoreError::Conflict`]
///
/// The engine's swallow rules depend on it: duplicate creations are
/// expected under queue redelivery and continue; terminal conflicts stop
/// cleanly; state conflicts indicate a lost update or programmer error
/// and propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Entity (or event for the correlation) already exists
    Duplicate,

    /// Target run, step, or hook is in a terminal state
    Terminal,

    /// Transition not permitted from the current status
    State,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate"),
            Self::Terminal => write!(f, "terminal"),
            Self::State => write!(f, "state"),
        }
    }
}

/// Error type for store operations
///
/// `LegacyUnsupported` and `VersionMismatch` are the two faces of the
/// spec-version gate; everything else follows the engine-wide taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity or correlation target absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate creation, terminal-state violation, or invalid transition
    #[error("conflict ({kind}): {message}")]
    Conflict { kind: ConflictKind, message: String },

    /// Target exists but is no longer accepting this operation
    #[error("gone: {0}")]
    Gone(String),

    /// Event type outside the allow-list for an older-spec run
    #[error("event {event_type} not supported for legacy runs")]
    LegacyUnsupported { event_type: String },

    /// Run was created under a newer spec than this engine supports
    #[error("run requires spec version {required}")]
    VersionMismatch { required: i32 },

    /// Malformed event input (e.g. missing correlation id)
    #[error("invalid event input: {0}")]
    InvalidInput(String),

    /// Backend I/O failure
    #[error("storage io error: {0}")]
    Io(String),

    /// Persisted data failed to (de)serialize
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::Duplicate,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::Terminal,
            message: message.into(),
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::State,
            message: message.into(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                kind: ConflictKind::Duplicate,
                ..
            }
        )
    }

    pub fn is_terminal_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                kind: ConflictKind::Terminal,
                ..
            }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result of accepting one event
///
/// Carries the event as recorded plus every entity the projection
/// touched. `event` is `None` exactly when the operation was an
/// idempotent no-op (`run_cancelled` on an already-cancelled run) or a
/// legacy-run `run_cancelled` status update.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event: Option<Event>,
    pub run: Option<Run>,
    pub step: Option<Step>,
    pub hook: Option<Hook>,
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub deployment_id: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(name) = &self.workflow_name {
            if &run.workflow_name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(deployment) = &self.deployment_id {
            if run.deployment_id.as_ref() != Some(deployment) {
                return false;
            }
        }
        true
    }
}

/// Event-sourced store for runs, steps, hooks, and events
///
/// Implementations must persist an event and its projected entity update
/// together: an observer that has seen the event must never read stale
/// entity fields. Single-writer backends serialize per run; transactional
/// backends use one transaction.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// The namespace this handle serves
    fn namespace(&self) -> &Namespace;

    // =========================================================================
    // Events
    // =========================================================================

    /// Accept one event and apply its projection.
    ///
    /// `run_id` is `None` only for `run_created`, in which case the store
    /// allocates the run id.
    async fn create_event(
        &self,
        run_id: Option<Uuid>,
        input: EventInput,
    ) -> Result<EventRecord, StoreError>;

    /// List a run's events; ascending time order by default
    async fn list_events(
        &self,
        run_id: Uuid,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Event>, StoreError>;

    /// List events for one correlation target within a run
    async fn list_events_by_correlation(
        &self,
        run_id: Uuid,
        correlation_id: &str,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Event>, StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError>;

    /// List runs; descending creation order by default
    async fn list_runs(
        &self,
        filter: RunFilter,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Run>, StoreError>;

    /// Delete a run and everything it owns (steps, hooks and their token
    /// bindings, events)
    async fn delete_run(&self, run_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn get_step(&self, run_id: Uuid, step_id: &str) -> Result<Step, StoreError>;

    /// List a run's steps; descending creation order by default
    async fn list_steps(
        &self,
        run_id: Uuid,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Step>, StoreError>;

    // =========================================================================
    // Hooks
    // =========================================================================

    async fn get_hook(&self, hook_id: &str) -> Result<Hook, StoreError>;

    /// Resolve a live hook by token; disposed hooks do not match
    async fn get_hook_by_token(&self, token: &str) -> Result<Hook, StoreError>;

    /// List hooks, optionally restricted to one run; descending creation
    /// order by default
    async fn list_hooks(
        &self,
        run_id: Option<Uuid>,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Hook>, StoreError>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Optional background work (sweeping waits, reclaiming leases)
    async fn start(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
