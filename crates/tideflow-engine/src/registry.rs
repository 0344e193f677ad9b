//! Workflow and step registries
//!
//! Handlers are registered by name at engine construction; the queue
//! handlers look them up when a message arrives. Registration is
//! build-time wiring — there is no dynamic code loading.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tideflow_core::StepFailure;

use crate::context::{Flow, RunContext};
use crate::retry::RetryPolicy;

/// A workflow body
///
/// The body must be deterministic given the replay context: wall-clock
/// reads, randomness, and I/O belong inside step handlers. Every replay
/// primitive is reached through `ctx`.
#[async_trait]
pub trait WorkflowHandler: Send + Sync + 'static {
    async fn run(&self, ctx: &RunContext, input: Value) -> Flow<Value>;
}

/// A step body: one unit of side-effectful work, retried independently
///
/// Return [`StepFailure::Fatal`] for permanent failures and
/// [`StepFailure::Retryable`] (or any error convertible into it) for
/// transient ones.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn execute(&self, input: Value) -> Result<Value, StepFailure>;
}

/// Per-step execution options
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Overrides the default retry policy
    pub retry: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            retry: Some(RetryPolicy::default().with_max_retries(max_retries)),
        }
    }
}

pub(crate) struct RegisteredStep {
    pub handler: Arc<dyn StepHandler>,
    pub retry: RetryPolicy,
}

/// Registry of workflow handlers by name
#[derive(Default)]
pub struct WorkflowRegistry {
    handlers: HashMap<String, Arc<dyn WorkflowHandler>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry of step handlers by name, with their retry policies
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, RegisteredStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
        options: StepOptions,
    ) {
        self.steps.insert(
            name.into(),
            RegisteredStep {
                handler,
                retry: options.retry.unwrap_or_default(),
            },
        );
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.steps.get(name).map(|s| Arc::clone(&s.handler))
    }

    pub fn retry_policy(&self, name: &str) -> Option<RetryPolicy> {
        self.steps.get(name).map(|s| s.retry.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl StepHandler for Doubler {
        async fn execute(&self, input: Value) -> Result<Value, StepFailure> {
            let n = input.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        }
    }

    struct Noop;

    #[async_trait]
    impl WorkflowHandler for Noop {
        async fn run(&self, _ctx: &RunContext, _input: Value) -> Flow<Value> {
            Ok(json!(null))
        }
    }

    #[test]
    fn test_workflow_registry() {
        let mut registry = WorkflowRegistry::new();
        registry.register("noop", Arc::new(Noop));

        assert!(registry.contains("noop"));
        assert!(!registry.contains("other"));
        assert!(registry.get("noop").is_some());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["noop"]);
    }

    #[test]
    fn test_step_registry_retry_override() {
        let mut registry = StepRegistry::new();
        registry.register("double", Arc::new(Doubler), StepOptions::default());
        registry.register(
            "fragile",
            Arc::new(Doubler),
            StepOptions::with_max_retries(1),
        );

        assert_eq!(registry.retry_policy("double").unwrap().max_retries, 3);
        assert_eq!(registry.retry_policy("fragile").unwrap().max_retries, 1);
        assert!(registry.retry_policy("absent").is_none());
    }

    #[tokio::test]
    async fn test_registered_step_executes() {
        let mut registry = StepRegistry::new();
        registry.register("double", Arc::new(Doubler), StepOptions::default());

        let handler = registry.handler("double").unwrap();
        let out = handler.execute(json!(21)).await.unwrap();
        assert_eq!(out, json!(42));
    }
}
