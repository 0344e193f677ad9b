//! In-memory implementation of WorkflowStore
//!
//! Primarily for tests and embedded use. All data lives behind one
//! `RwLock`, which trivially satisfies the event-append + projection
//! atomicity requirement.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use tideflow_core::page::paginate;
use tideflow_core::{
    Event, EventInput, EventPayload, Hook, Namespace, Page, PageRequest, Run, SortOrder, Step,
};

use crate::state::{self, ApplyCtx, RunProjection, Target, TokenOp, Transition};
use crate::store::{EventRecord, RunFilter, StoreError, WorkflowStore};

/// Live-token binding
#[derive(Debug, Clone)]
struct TokenBinding {
    run_id: Uuid,
    hook_id: String,
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<Uuid, RunProjection>,
    tokens: HashMap<String, TokenBinding>,
}

/// In-memory event-sourced store
///
/// # Example
///
/// ```
/// use tideflow_storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    namespace: Namespace,
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_namespace(Namespace::default())
    }

    pub fn with_namespace(namespace: Namespace) -> Self {
        Self {
            namespace,
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Number of runs currently stored
    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    /// Insert a run entity directly, bypassing the event log.
    ///
    /// Migration/test support: the only way to obtain a run whose
    /// `spec_version` differs from the current one.
    pub fn seed_run(&self, run: Run) {
        let mut inner = self.inner.write();
        inner.runs.insert(
            run.run_id,
            RunProjection {
                run,
                steps: HashMap::new(),
                hooks: HashMap::new(),
                waits: HashMap::new(),
                events: Vec::new(),
            },
        );
    }

    fn apply_transition(
        inner: &mut MemoryInner,
        run_id: Uuid,
        transition: Transition,
    ) -> EventRecord {
        let MemoryInner { runs, tokens } = inner;

        if let Some(op) = &transition.token_op {
            match op {
                TokenOp::Bind { token, hook_id } => {
                    tokens.insert(
                        token.clone(),
                        TokenBinding {
                            run_id,
                            hook_id: hook_id.clone(),
                        },
                    );
                }
                TokenOp::Release { token } => {
                    tokens.remove(token);
                }
            }
        }

        if let Some(proj) = runs.get_mut(&run_id) {
            proj.run = transition.run.clone();

            if let Some(step) = &transition.step {
                proj.steps.insert(step.step_id.clone(), step.clone());
            }
            if let Some(hook) = &transition.hook {
                proj.hooks.insert(hook.hook_id.clone(), hook.clone());
            }
            if let Some(wait) = &transition.wait {
                proj.waits.insert(wait.wait_id.clone(), wait.clone());
            }
            if let Some(event) = &transition.event {
                proj.events.push(event.clone());
            }

            if transition.dispose_hooks {
                for hook in proj.hooks.values_mut() {
                    hook.disposed = true;
                }
                tokens.retain(|_, binding| binding.run_id != run_id);
            }
        }

        EventRecord {
            event: transition.event,
            run: Some(transition.run),
            step: transition.step,
            hook: transition.hook,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn create_event(
        &self,
        run_id: Option<Uuid>,
        input: EventInput,
    ) -> Result<EventRecord, StoreError> {
        let mut inner = self.inner.write();
        let ctx = ApplyCtx {
            now: Utc::now(),
            event_id: Uuid::now_v7(),
            token_bound_elsewhere: false,
        };

        let run_id = match run_id {
            None => {
                // Storage allocates the run id for run_created.
                let run_id = Uuid::now_v7();
                let (event, run) = state::create_run(run_id, &input, &ctx)?;
                inner.runs.insert(
                    run_id,
                    RunProjection {
                        run: run.clone(),
                        steps: HashMap::new(),
                        hooks: HashMap::new(),
                        waits: HashMap::new(),
                        events: vec![event.clone()],
                    },
                );
                return Ok(EventRecord {
                    event: Some(event),
                    run: Some(run),
                    step: None,
                    hook: None,
                });
            }
            Some(run_id) => run_id,
        };

        let proj = inner
            .runs
            .get(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;

        let correlation = input.correlation_id.as_deref();
        let target = match (&input.payload, correlation) {
            (
                EventPayload::StepCreated { .. }
                | EventPayload::StepStarted
                | EventPayload::StepCompleted { .. }
                | EventPayload::StepFailed { .. }
                | EventPayload::StepRetrying { .. },
                Some(id),
            ) => proj
                .steps
                .get(id)
                .cloned()
                .map(Target::Step)
                .unwrap_or(Target::None),
            (
                EventPayload::HookCreated { .. }
                | EventPayload::HookReceived { .. }
                | EventPayload::HookDisposed,
                Some(id),
            ) => proj
                .hooks
                .get(id)
                .cloned()
                .map(Target::Hook)
                .unwrap_or(Target::None),
            (EventPayload::WaitCreated { .. } | EventPayload::WaitCompleted, Some(id)) => proj
                .waits
                .get(id)
                .cloned()
                .map(Target::Wait)
                .unwrap_or(Target::None),
            _ => Target::None,
        };

        let ctx = match (&input.payload, correlation) {
            (EventPayload::HookCreated { token, .. }, Some(hook_id)) => ApplyCtx {
                token_bound_elsewhere: inner
                    .tokens
                    .get(token)
                    .map(|binding| binding.run_id != run_id || binding.hook_id != hook_id)
                    .unwrap_or(false),
                ..ctx
            },
            _ => ctx,
        };

        let transition = state::transition(&proj.run, target, &input, &ctx)?;
        Ok(Self::apply_transition(&mut inner, run_id, transition))
    }

    async fn list_events(
        &self,
        run_id: Uuid,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Event>, StoreError> {
        let inner = self.inner.read();
        let proj = inner
            .runs
            .get(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;

        let order = order.unwrap_or(SortOrder::Asc);
        let mut events = proj.events.clone();
        sort_by_key(&mut events, order, |e| (e.created_at, e.event_id.to_string()));
        Ok(paginate(events, order, &page, |e| {
            (e.created_at, e.event_id.to_string())
        }))
    }

    async fn list_events_by_correlation(
        &self,
        run_id: Uuid,
        correlation_id: &str,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Event>, StoreError> {
        let inner = self.inner.read();
        let proj = inner
            .runs
            .get(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;

        let order = order.unwrap_or(SortOrder::Asc);
        let mut events: Vec<Event> = proj
            .events
            .iter()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect();
        sort_by_key(&mut events, order, |e| (e.created_at, e.event_id.to_string()));
        Ok(paginate(events, order, &page, |e| {
            (e.created_at, e.event_id.to_string())
        }))
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let inner = self.inner.read();
        inner
            .runs
            .get(&run_id)
            .map(|proj| proj.run.clone())
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Run>, StoreError> {
        let inner = self.inner.read();
        let order = order.unwrap_or(SortOrder::Desc);
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .map(|proj| proj.run.clone())
            .filter(|run| filter.matches(run))
            .collect();
        sort_by_key(&mut runs, order, |r| (r.created_at, r.run_id.to_string()));
        Ok(paginate(runs, order, &page, |r| {
            (r.created_at, r.run_id.to_string())
        }))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .runs
            .remove(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;
        inner.tokens.retain(|_, binding| binding.run_id != run_id);
        Ok(())
    }

    async fn get_step(&self, run_id: Uuid, step_id: &str) -> Result<Step, StoreError> {
        let inner = self.inner.read();
        inner
            .runs
            .get(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?
            .steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("step {step_id}")))
    }

    async fn list_steps(
        &self,
        run_id: Uuid,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Step>, StoreError> {
        let inner = self.inner.read();
        let proj = inner
            .runs
            .get(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;

        let order = order.unwrap_or(SortOrder::Desc);
        let mut steps: Vec<Step> = proj.steps.values().cloned().collect();
        sort_by_key(&mut steps, order, |s| (s.created_at, s.step_id.clone()));
        Ok(paginate(steps, order, &page, |s| {
            (s.created_at, s.step_id.clone())
        }))
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Hook, StoreError> {
        let inner = self.inner.read();
        inner
            .runs
            .values()
            .find_map(|proj| proj.hooks.get(hook_id))
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("hook {hook_id}")))
    }

    async fn get_hook_by_token(&self, token: &str) -> Result<Hook, StoreError> {
        let inner = self.inner.read();
        let binding = inner
            .tokens
            .get(token)
            .ok_or_else(|| StoreError::not_found(format!("hook token {token}")))?;
        inner
            .runs
            .get(&binding.run_id)
            .and_then(|proj| proj.hooks.get(&binding.hook_id))
            .filter(|hook| hook.is_live())
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("hook token {token}")))
    }

    async fn list_hooks(
        &self,
        run_id: Option<Uuid>,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Hook>, StoreError> {
        let inner = self.inner.read();
        let order = order.unwrap_or(SortOrder::Desc);

        let mut hooks: Vec<Hook> = match run_id {
            Some(run_id) => inner
                .runs
                .get(&run_id)
                .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?
                .hooks
                .values()
                .cloned()
                .collect(),
            None => inner
                .runs
                .values()
                .flat_map(|proj| proj.hooks.values().cloned())
                .collect(),
        };
        sort_by_key(&mut hooks, order, |h| (h.created_at, h.hook_id.clone()));
        Ok(paginate(hooks, order, &page, |h| {
            (h.created_at, h.hook_id.clone())
        }))
    }
}

fn sort_by_key<T>(
    items: &mut [T],
    order: SortOrder,
    key: impl Fn(&T) -> (chrono::DateTime<Utc>, String),
) {
    items.sort_by(|a, b| {
        let ordering = key(a).cmp(&key(b));
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideflow_core::{RunStatus, SerialForm, StepStatus, SPEC_VERSION};

    async fn start_run(store: &MemoryStore) -> Uuid {
        let record = store
            .create_event(
                None,
                EventInput::new(EventPayload::RunCreated {
                    workflow_name: "order".to_string(),
                    deployment_id: None,
                    input: SerialForm(json!([1])),
                    execution_context: None,
                }),
            )
            .await
            .unwrap();
        let run_id = record.run.unwrap().run_id;

        store
            .create_event(Some(run_id), EventInput::new(EventPayload::RunStarted))
            .await
            .unwrap();
        run_id
    }

    fn step_created(step_id: &str) -> EventInput {
        EventInput::new(EventPayload::StepCreated {
            step_name: "fetch".to_string(),
            input: SerialForm(json!([])),
        })
        .with_correlation(step_id)
    }

    fn hook_created(hook_id: &str, token: &str) -> EventInput {
        EventInput::new(EventPayload::HookCreated {
            token: token.to_string(),
            metadata: None,
        })
        .with_correlation(hook_id)
    }

    #[tokio::test]
    async fn test_run_created_allocates_id() {
        let store = MemoryStore::new();
        let record = store
            .create_event(
                None,
                EventInput::new(EventPayload::RunCreated {
                    workflow_name: "order".to_string(),
                    deployment_id: None,
                    input: SerialForm(json!(null)),
                    execution_context: None,
                }),
            )
            .await
            .unwrap();

        let run = record.run.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(store.run_count(), 1);
        assert_eq!(record.event.unwrap().run_id, run.run_id);
    }

    #[tokio::test]
    async fn test_step_lifecycle_and_projection() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        store
            .create_event(Some(run_id), step_created("fetch#0"))
            .await
            .unwrap();
        let record = store
            .create_event(
                Some(run_id),
                EventInput::new(EventPayload::StepStarted).with_correlation("fetch#0"),
            )
            .await
            .unwrap();
        assert_eq!(record.step.as_ref().unwrap().attempt, 1);

        let step = store.get_step(run_id, "fetch#0").await.unwrap();
        assert_eq!(step.status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_duplicate_step_creation_conflicts() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        store
            .create_event(Some(run_id), step_created("fetch#0"))
            .await
            .unwrap();
        let err = store
            .create_event(Some(run_id), step_created("fetch#0"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_token_collision_and_reuse_after_dispose() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        store
            .create_event(Some(run_id), hook_created("hook#0", "t"))
            .await
            .unwrap();

        // Second hook with the same token: conflict event, no entity.
        let record = store
            .create_event(Some(run_id), hook_created("hook#1", "t"))
            .await
            .unwrap();
        assert_eq!(record.event.unwrap().payload.event_type(), "hook_conflict");
        assert!(record.hook.is_none());
        assert!(store.get_hook("hook#1").await.is_err());

        // First hook is still resolvable by token.
        let live = store.get_hook_by_token("t").await.unwrap();
        assert_eq!(live.hook_id, "hook#0");

        // Dispose frees the token for reuse.
        store
            .create_event(
                Some(run_id),
                EventInput::new(EventPayload::HookDisposed).with_correlation("hook#0"),
            )
            .await
            .unwrap();
        let record = store
            .create_event(Some(run_id), hook_created("hook#1", "t"))
            .await
            .unwrap();
        assert_eq!(record.hook.unwrap().hook_id, "hook#1");
    }

    #[tokio::test]
    async fn test_redelivered_hook_created_same_id_is_duplicate() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        store
            .create_event(Some(run_id), hook_created("hook#0", "t"))
            .await
            .unwrap();
        // Same correlation id again (queue redelivery): duplicate, not a
        // token conflict.
        let err = store
            .create_event(Some(run_id), hook_created("hook#0", "t"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_run_terminal_disposes_hooks() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        store
            .create_event(Some(run_id), hook_created("hook#0", "t"))
            .await
            .unwrap();
        store
            .create_event(Some(run_id), EventInput::new(EventPayload::RunCancelled))
            .await
            .unwrap();

        let hook = store.get_hook("hook#0").await.unwrap();
        assert!(hook.disposed);
        assert!(store.get_hook_by_token("t").await.is_err());
    }

    #[tokio::test]
    async fn test_legacy_gate() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        // Rewrite the run as legacy.
        let mut run = store.get_run(run_id).await.unwrap();
        run.spec_version = SPEC_VERSION - 1;
        store.seed_run(run);

        let err = store
            .create_event(Some(run_id), EventInput::new(EventPayload::RunStarted))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported for legacy runs"));

        let record = store
            .create_event(Some(run_id), EventInput::new(EventPayload::RunCancelled))
            .await
            .unwrap();
        assert!(record.event.is_none());
        assert_eq!(record.run.unwrap().status, RunStatus::Cancelled);

        let events = store
            .list_events(run_id, None, PageRequest::default())
            .await
            .unwrap();
        assert!(events.data.is_empty());
    }

    #[tokio::test]
    async fn test_projection_matches_fold() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        store
            .create_event(Some(run_id), step_created("fetch#0"))
            .await
            .unwrap();
        store
            .create_event(
                Some(run_id),
                EventInput::new(EventPayload::StepStarted).with_correlation("fetch#0"),
            )
            .await
            .unwrap();
        store
            .create_event(
                Some(run_id),
                EventInput::new(EventPayload::StepCompleted {
                    output: SerialForm(json!(1)),
                })
                .with_correlation("fetch#0"),
            )
            .await
            .unwrap();
        store
            .create_event(
                Some(run_id),
                EventInput::new(EventPayload::RunCompleted {
                    output: SerialForm(json!(1)),
                }),
            )
            .await
            .unwrap();

        let events = store
            .list_events(run_id, None, PageRequest::with_limit(100))
            .await
            .unwrap()
            .data;
        let folded = crate::state::fold_events(&events).unwrap();

        let stored = store.get_run(run_id).await.unwrap();
        assert_eq!(folded.run.status, stored.status);
        assert_eq!(folded.run.output, stored.output);

        let stored_step = store.get_step(run_id, "fetch#0").await.unwrap();
        let folded_step = &folded.steps["fetch#0"];
        assert_eq!(folded_step.status, stored_step.status);
        assert_eq!(folded_step.attempt, stored_step.attempt);
        assert_eq!(folded_step.output, stored_step.output);
    }

    #[tokio::test]
    async fn test_step_listing_cursor_across_inserts() {
        let store = MemoryStore::new();
        let run_id = start_run(&store).await;

        for n in 0..4 {
            store
                .create_event(Some(run_id), step_created(&format!("s#{n}")))
                .await
                .unwrap();
        }

        let page = store
            .list_steps(run_id, None, PageRequest::with_limit(4))
            .await
            .unwrap();
        assert_eq!(page.data.len(), 4);
        assert!(!page.has_more);
        let cursor = page.cursor.expect("cursor set at end of listing");

        for n in 4..8 {
            store
                .create_event(Some(run_id), step_created(&format!("s#{n}")))
                .await
                .unwrap();
        }

        // Continuing from the cursor skips the newer inserts entirely.
        let next = store
            .list_steps(
                run_id,
                None,
                PageRequest::with_limit(4).with_cursor(cursor),
            )
            .await
            .unwrap();
        assert!(next.data.is_empty());

        // A fresh listing returns the four newest.
        let fresh = store
            .list_steps(run_id, None, PageRequest::with_limit(4))
            .await
            .unwrap();
        let ids: Vec<&str> = fresh.data.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["s#7", "s#6", "s#5", "s#4"]);
        assert!(fresh.has_more);
    }
}
