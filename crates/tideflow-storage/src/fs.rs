//! Filesystem implementation of WorkflowStore
//!
//! One JSON file per entity under a root data directory, intended for
//! local development:
//!
//! ```text
//! <root>/<owner>/<project>/<environment>/
//!   runs/<run_id>/run.json
//!   runs/<run_id>/events/<event_id>.json
//!   runs/<run_id>/steps/<key>.json
//!   runs/<run_id>/hooks/<key>.json
//!   runs/<run_id>/waits/<key>.json
//!   tokens/<key>.json
//! ```
//!
//! Event ids are UUID v7, so sorting event file names is sorting by
//! time. Ids used as file names are percent-encoded. A per-run async
//! mutex serializes the event-append + projection pair; a store-wide
//! mutex serializes token binding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use tideflow_core::page::paginate;
use tideflow_core::{
    Event, EventInput, EventPayload, Hook, Namespace, Page, PageRequest, Run, SortOrder, Step,
};

use crate::state::{self, ApplyCtx, Target, TokenOp, Transition, WaitState};
use crate::store::{EventRecord, RunFilter, StoreError, WorkflowStore};

/// Live-token binding persisted under `tokens/`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenBinding {
    token: String,
    run_id: Uuid,
    hook_id: String,
}

/// Filesystem-backed event-sourced store
pub struct FsStore {
    namespace: Namespace,
    root: PathBuf,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    token_lock: Mutex<()>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_namespace(root, Namespace::default())
    }

    pub fn with_namespace(root: impl Into<PathBuf>, namespace: Namespace) -> Self {
        let root = root
            .into()
            .join(&namespace.owner)
            .join(&namespace.project)
            .join(&namespace.environment);
        Self {
            namespace,
            root,
            run_locks: DashMap::new(),
            token_lock: Mutex::new(()),
        }
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir().join(run_id.to_string())
    }

    fn run_file(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn entity_file(&self, run_id: Uuid, kind: &str, key: &str) -> PathBuf {
        self.run_dir(run_id).join(kind).join(format!("{}.json", fs_key(key)))
    }

    fn token_file(&self, token: &str) -> PathBuf {
        self.root.join("tokens").join(format!("{}.json", fs_key(token)))
    }

    /// Insert a run entity directly, bypassing the event log.
    ///
    /// Migration/test support: the only way to obtain a run whose
    /// `spec_version` differs from the current one.
    pub async fn seed_run(&self, run: Run) -> Result<(), StoreError> {
        let _guard = self.run_lock(run.run_id).lock_owned().await;
        write_json(&self.run_file(run.run_id), &run).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        read_json::<Run>(&self.run_file(run_id))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))
    }

    async fn load_target(
        &self,
        run_id: Uuid,
        input: &EventInput,
    ) -> Result<Target, StoreError> {
        let Some(correlation) = input.correlation_id.as_deref() else {
            return Ok(Target::None);
        };

        match &input.payload {
            EventPayload::StepCreated { .. }
            | EventPayload::StepStarted
            | EventPayload::StepCompleted { .. }
            | EventPayload::StepFailed { .. }
            | EventPayload::StepRetrying { .. } => {
                Ok(read_json::<Step>(&self.entity_file(run_id, "steps", correlation))
                    .await?
                    .map(Target::Step)
                    .unwrap_or(Target::None))
            }
            EventPayload::HookCreated { .. }
            | EventPayload::HookReceived { .. }
            | EventPayload::HookDisposed => {
                Ok(read_json::<Hook>(&self.entity_file(run_id, "hooks", correlation))
                    .await?
                    .map(Target::Hook)
                    .unwrap_or(Target::None))
            }
            EventPayload::WaitCreated { .. } | EventPayload::WaitCompleted => {
                Ok(read_json::<WaitState>(&self.entity_file(run_id, "waits", correlation))
                    .await?
                    .map(Target::Wait)
                    .unwrap_or(Target::None))
            }
            _ => Ok(Target::None),
        }
    }

    /// Persist everything a transition touched. Entity files are written
    /// before the event file, so an observer that has seen the event
    /// never reads stale entities.
    async fn persist_transition(
        &self,
        run_id: Uuid,
        transition: &Transition,
    ) -> Result<(), StoreError> {
        if let Some(step) = &transition.step {
            write_json(&self.entity_file(run_id, "steps", &step.step_id), step).await?;
        }
        if let Some(hook) = &transition.hook {
            write_json(&self.entity_file(run_id, "hooks", &hook.hook_id), hook).await?;
        }
        if let Some(wait) = &transition.wait {
            write_json(&self.entity_file(run_id, "waits", &wait.wait_id), wait).await?;
        }

        if let Some(op) = &transition.token_op {
            match op {
                TokenOp::Bind { token, hook_id } => {
                    write_json(
                        &self.token_file(token),
                        &TokenBinding {
                            token: token.clone(),
                            run_id,
                            hook_id: hook_id.clone(),
                        },
                    )
                    .await?;
                }
                TokenOp::Release { token } => {
                    remove_file_if_exists(&self.token_file(token)).await?;
                }
            }
        }

        if transition.dispose_hooks {
            self.dispose_run_hooks(run_id).await?;
        }

        write_json(&self.run_file(run_id), &transition.run).await?;

        if let Some(event) = &transition.event {
            write_json(
                &self.entity_file(run_id, "events", &event.event_id.to_string()),
                event,
            )
            .await?;
        }

        Ok(())
    }

    async fn dispose_run_hooks(&self, run_id: Uuid) -> Result<(), StoreError> {
        let hooks: Vec<Hook> = read_dir_json(&self.run_dir(run_id).join("hooks")).await?;
        for mut hook in hooks {
            if hook.disposed {
                continue;
            }
            remove_file_if_exists(&self.token_file(&hook.token)).await?;
            hook.disposed = true;
            write_json(&self.entity_file(run_id, "hooks", &hook.hook_id), &hook).await?;
        }
        Ok(())
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<Event>, StoreError> {
        // Run must exist even when it has no events on disk yet.
        self.load_run(run_id).await?;
        let mut events: Vec<Event> = read_dir_json(&self.run_dir(run_id).join("events")).await?;
        events.sort_by(|a, b| {
            (a.created_at, a.event_id)
                .cmp(&(b.created_at, b.event_id))
        });
        Ok(events)
    }
}

#[async_trait]
impl WorkflowStore for FsStore {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn create_event(
        &self,
        run_id: Option<Uuid>,
        input: EventInput,
    ) -> Result<EventRecord, StoreError> {
        let ctx = ApplyCtx {
            now: Utc::now(),
            event_id: Uuid::now_v7(),
            token_bound_elsewhere: false,
        };

        let Some(run_id) = run_id else {
            let run_id = Uuid::now_v7();
            let _guard = self.run_lock(run_id).lock_owned().await;
            let (event, run) = state::create_run(run_id, &input, &ctx)?;
            write_json(&self.run_file(run_id), &run).await?;
            write_json(
                &self.entity_file(run_id, "events", &event.event_id.to_string()),
                &event,
            )
            .await?;
            debug!(%run_id, workflow = %run.workflow_name, "run created");
            return Ok(EventRecord {
                event: Some(event),
                run: Some(run),
                step: None,
                hook: None,
            });
        };

        let _guard = self.run_lock(run_id).lock_owned().await;

        // Token-affecting events hold the token lock from the uniqueness
        // check through the index write. Lock order is run, then tokens.
        let _tokens = if matches!(
            input.payload,
            EventPayload::HookCreated { .. }
                | EventPayload::HookDisposed
                | EventPayload::RunCompleted { .. }
                | EventPayload::RunFailed { .. }
                | EventPayload::RunCancelled
        ) {
            Some(self.token_lock.lock().await)
        } else {
            None
        };

        let run = self.load_run(run_id).await?;
        let target = self.load_target(run_id, &input).await?;

        let ctx = match (&input.payload, input.correlation_id.as_deref()) {
            (EventPayload::HookCreated { token, .. }, Some(hook_id)) => {
                let bound = read_json::<TokenBinding>(&self.token_file(token)).await?;
                ApplyCtx {
                    token_bound_elsewhere: bound
                        .map(|b| b.run_id != run_id || b.hook_id != hook_id)
                        .unwrap_or(false),
                    ..ctx
                }
            }
            _ => ctx,
        };

        let transition = state::transition(&run, target, &input, &ctx)?;
        self.persist_transition(run_id, &transition).await?;

        Ok(EventRecord {
            event: transition.event,
            run: Some(transition.run),
            step: transition.step,
            hook: transition.hook,
        })
    }

    async fn list_events(
        &self,
        run_id: Uuid,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Event>, StoreError> {
        let order = order.unwrap_or(SortOrder::Asc);
        let mut events = self.load_events(run_id).await?;
        if order == SortOrder::Desc {
            events.reverse();
        }
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
        let order = order.unwrap_or(SortOrder::Asc);
        let mut events = self.load_events(run_id).await?;
        events.retain(|e| e.correlation_id.as_deref() == Some(correlation_id));
        if order == SortOrder::Desc {
            events.reverse();
        }
        Ok(paginate(events, order, &page, |e| {
            (e.created_at, e.event_id.to_string())
        }))
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        self.load_run(run_id).await
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Run>, StoreError> {
        let order = order.unwrap_or(SortOrder::Desc);
        let mut runs = Vec::new();
        for dir in read_subdirs(&self.runs_dir()).await? {
            if let Some(run) = read_json::<Run>(&dir.join("run.json")).await? {
                if filter.matches(&run) {
                    runs.push(run);
                }
            }
        }
        sort_entities(&mut runs, order, |r| (r.created_at, r.run_id.to_string()));
        Ok(paginate(runs, order, &page, |r| {
            (r.created_at, r.run_id.to_string())
        }))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let _guard = self.run_lock(run_id).lock_owned().await;
        self.load_run(run_id).await?;

        // Release the run's tokens before the files go away.
        let _tokens = self.token_lock.lock().await;
        let hooks: Vec<Hook> = read_dir_json(&self.run_dir(run_id).join("hooks")).await?;
        for hook in hooks {
            remove_file_if_exists(&self.token_file(&hook.token)).await?;
        }

        tokio::fs::remove_dir_all(self.run_dir(run_id))
            .await
            .map_err(|e| StoreError::Io(format!("delete run {run_id}: {e}")))?;
        self.run_locks.remove(&run_id);
        debug!(%run_id, "run deleted");
        Ok(())
    }

    async fn get_step(&self, run_id: Uuid, step_id: &str) -> Result<Step, StoreError> {
        self.load_run(run_id).await?;
        read_json::<Step>(&self.entity_file(run_id, "steps", step_id))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("step {step_id}")))
    }

    async fn list_steps(
        &self,
        run_id: Uuid,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Step>, StoreError> {
        self.load_run(run_id).await?;
        let order = order.unwrap_or(SortOrder::Desc);
        let mut steps: Vec<Step> = read_dir_json(&self.run_dir(run_id).join("steps")).await?;
        sort_entities(&mut steps, order, |s| (s.created_at, s.step_id.clone()));
        Ok(paginate(steps, order, &page, |s| {
            (s.created_at, s.step_id.clone())
        }))
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Hook, StoreError> {
        for dir in read_subdirs(&self.runs_dir()).await? {
            let candidate = dir.join("hooks").join(format!("{}.json", fs_key(hook_id)));
            if let Some(hook) = read_json::<Hook>(&candidate).await? {
                return Ok(hook);
            }
        }
        Err(StoreError::not_found(format!("hook {hook_id}")))
    }

    async fn get_hook_by_token(&self, token: &str) -> Result<Hook, StoreError> {
        let binding = read_json::<TokenBinding>(&self.token_file(token))
            .await?
            .ok_or_else(|| StoreError::not_found(format!("hook token {token}")))?;

        read_json::<Hook>(&self.entity_file(binding.run_id, "hooks", &binding.hook_id))
            .await?
            .filter(|hook| hook.is_live())
            .ok_or_else(|| StoreError::not_found(format!("hook token {token}")))
    }

    async fn list_hooks(
        &self,
        run_id: Option<Uuid>,
        order: Option<SortOrder>,
        page: PageRequest,
    ) -> Result<Page<Hook>, StoreError> {
        let order = order.unwrap_or(SortOrder::Desc);
        let mut hooks: Vec<Hook> = match run_id {
            Some(run_id) => {
                self.load_run(run_id).await?;
                read_dir_json(&self.run_dir(run_id).join("hooks")).await?
            }
            None => {
                let mut all = Vec::new();
                for dir in read_subdirs(&self.runs_dir()).await? {
                    all.extend(read_dir_json::<Hook>(&dir.join("hooks")).await?);
                }
                all
            }
        };
        sort_entities(&mut hooks, order, |h| (h.created_at, h.hook_id.clone()));
        Ok(paginate(hooks, order, &page, |h| {
            (h.created_at, h.hook_id.clone())
        }))
    }
}

// =============================================================================
// File helpers
// =============================================================================

/// Encode an id for use as a file name. Alphanumerics plus `. _ -` pass
/// through; every other byte becomes `%XX`.
fn fs_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Io(format!("mkdir {}: {e}", parent.display())))?;
    }

    let raw = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, raw)
        .await
        .map_err(|e| StoreError::Io(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::Io(format!("rename {}: {e}", path.display())))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(format!("remove {}: {e}", path.display()))),
    }
}

/// Read every `.json` file in a directory. A missing directory is an
/// empty collection.
async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io(format!("read dir {}: {e}", dir.display()))),
    };

    let mut items = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::Io(format!("read dir {}: {e}", dir.display())))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(item) = read_json(&path).await? {
            items.push(item);
        }
    }
    Ok(items)
}

async fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io(format!("read dir {}: {e}", dir.display()))),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::Io(format!("read dir {}: {e}", dir.display())))?
    {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn sort_entities<T>(
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
