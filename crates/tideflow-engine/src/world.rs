//! The composite backend handle and its env-driven selection
//!
//! Storage, queue, and serialization are three independent capability
//! sets; the engine receives them as one [`World`] and never references
//! a backend by name after construction. Selection happens through a
//! build-time registration map keyed by `WORKFLOW_TARGET_WORLD` — there
//! is no dynamic code loading.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tideflow_core::{Codec, JsonCodec, Namespace};
use tideflow_queue::{MemoryQueue, WorkQueue};
use tideflow_storage::{FsStore, MemoryStore, WorkflowStore};

use crate::engine::EngineError;

/// Backend selector environment variable
pub const TARGET_WORLD_ENV: &str = "WORKFLOW_TARGET_WORLD";

/// Root directory for the filesystem backend
pub const LOCAL_DATA_DIR_ENV: &str = "WORKFLOW_LOCAL_DATA_DIR";

const DEFAULT_DATA_DIR: &str = ".tideflow";

/// The three capabilities the engine consumes
#[derive(Clone)]
pub struct World {
    pub storage: Arc<dyn WorkflowStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub codec: Arc<dyn Codec>,
}

impl World {
    pub fn new(
        storage: Arc<dyn WorkflowStore>,
        queue: Arc<dyn WorkQueue>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            storage,
            queue,
            codec,
        }
    }

    /// Everything in memory; the default for tests and embedded use
    pub fn memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryQueue::new()),
            Arc::new(JsonCodec::new()),
        )
    }

    /// Filesystem storage under `data_dir`, in-memory queue
    pub fn local(data_dir: impl Into<PathBuf>, namespace: Namespace) -> Self {
        Self::new(
            Arc::new(FsStore::with_namespace(data_dir, namespace)),
            Arc::new(MemoryQueue::new()),
            Arc::new(JsonCodec::new()),
        )
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("namespace", self.storage.namespace())
            .finish()
    }
}

/// Inputs to a world factory
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub target: String,
    pub data_dir: PathBuf,
    pub namespace: Namespace,
}

impl WorldSettings {
    /// Read settings from the environment (after loading `.env`).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            target: std::env::var(TARGET_WORLD_ENV).unwrap_or_else(|_| "local".to_string()),
            data_dir: std::env::var(LOCAL_DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            namespace: Namespace::default(),
        }
    }
}

type WorldFactory = Arc<dyn Fn(&WorldSettings) -> Result<World, EngineError> + Send + Sync>;

/// Build-time registration map of world names to factories
pub struct WorldSelector {
    factories: HashMap<String, WorldFactory>,
}

impl WorldSelector {
    /// The built-in worlds: `local` (filesystem storage) and `memory`
    pub fn builtin() -> Self {
        let mut selector = Self {
            factories: HashMap::new(),
        };
        selector.register("local", |settings: &WorldSettings| {
            Ok(World::local(
                settings.data_dir.clone(),
                settings.namespace.clone(),
            ))
        });
        selector.register("memory", |_| Ok(World::memory()));
        selector
    }

    /// Register an external backend under a name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&WorldSettings) -> Result<World, EngineError> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Resolve settings to a world
    pub fn resolve(&self, settings: &WorldSettings) -> Result<World, EngineError> {
        let factory = self.factories.get(&settings.target).ok_or_else(|| {
            EngineError::Config(format!(
                "unknown target world \"{}\" (registered: {})",
                settings.target,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(settings)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Resolve a world straight from the environment.
pub fn world_from_env() -> Result<World, EngineError> {
    WorldSelector::builtin().resolve(&WorldSettings::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_worlds_resolve() {
        let selector = WorldSelector::builtin();
        let dir = tempfile::tempdir().unwrap();

        let settings = WorldSettings {
            target: "memory".to_string(),
            data_dir: dir.path().to_path_buf(),
            namespace: Namespace::default(),
        };
        assert!(selector.resolve(&settings).is_ok());

        let settings = WorldSettings {
            target: "local".to_string(),
            ..settings
        };
        assert!(selector.resolve(&settings).is_ok());
    }

    #[test]
    fn test_unknown_world_is_a_config_error() {
        let selector = WorldSelector::builtin();
        let settings = WorldSettings {
            target: "mainframe".to_string(),
            data_dir: PathBuf::from("/tmp"),
            namespace: Namespace::default(),
        };

        match selector.resolve(&settings) {
            Err(EngineError::Config(message)) => {
                assert!(message.contains("unknown target world \"mainframe\""));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_external_registration() {
        let mut selector = WorldSelector::builtin();
        selector.register("custom", |_| Ok(World::memory()));

        let settings = WorldSettings {
            target: "custom".to_string(),
            data_dir: PathBuf::from("/tmp"),
            namespace: Namespace::default(),
        };
        assert!(selector.resolve(&settings).is_ok());
    }
}
