//! Build-time workflow manifest
//!
//! Produced by source analysis at build time and consumed read-only. It
//! maps file paths to the steps and workflows they define, with ids that
//! stay stable across bundler renames. The graphs are advisory
//! (visualization only) and are deliberately kept as raw JSON — the
//! engine never reads them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Manifest entry for a step function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    /// Stable id, e.g. `step//src/flows.ts//fetch_user`
    pub step_id: String,
}

/// Manifest entry for a workflow function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEntry {
    /// Stable id, e.g. `workflow//src/flows.ts//order`
    pub workflow_id: String,

    /// Advisory visualization graph; never interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<serde_json::Value>,
}

/// The manifest artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,

    /// file path -> step name -> entry
    #[serde(default)]
    pub steps: HashMap<String, HashMap<String, StepEntry>>,

    /// file path -> workflow name -> entry
    #[serde(default)]
    pub workflows: HashMap<String, HashMap<String, WorkflowEntry>>,
}

impl Manifest {
    /// Load a manifest from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| ManifestError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Whether any file defines a workflow with this name
    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.values().any(|by_name| by_name.contains_key(name))
    }

    /// Whether any file defines a step with this name
    pub fn has_step(&self, name: &str) -> bool {
        self.steps.values().any(|by_name| by_name.contains_key(name))
    }

    /// All workflow names across files
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows
            .values()
            .flat_map(|by_name| by_name.keys())
            .map(String::as_str)
    }
}

/// Errors loading a manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "version": "1.0.0",
            "steps": {
                "src/flows.ts": {
                    "fetch_user": { "stepId": "step//src/flows.ts//fetch_user" }
                }
            },
            "workflows": {
                "src/flows.ts": {
                    "order": {
                        "workflowId": "workflow//src/flows.ts//order",
                        "graph": { "nodes": [], "edges": [] }
                    }
                }
            }
        })
    }

    #[test]
    fn test_parse_manifest() {
        let manifest: Manifest = serde_json::from_value(sample()).unwrap();
        assert_eq!(manifest.version, "1.0.0");
        assert!(manifest.has_workflow("order"));
        assert!(manifest.has_step("fetch_user"));
        assert!(!manifest.has_step("order"));
    }

    #[test]
    fn test_graph_is_opaque() {
        let manifest: Manifest = serde_json::from_value(sample()).unwrap();
        let entry = &manifest.workflows["src/flows.ts"]["order"];
        assert!(entry.graph.is_some());
        assert_eq!(entry.workflow_id, "workflow//src/flows.ts//order");
    }

    #[test]
    fn test_missing_sections_default_empty() {
        let manifest: Manifest = serde_json::from_value(json!({ "version": "1.0.0" })).unwrap();
        assert!(manifest.steps.is_empty());
        assert!(manifest.workflow_names().next().is_none());
    }
}
