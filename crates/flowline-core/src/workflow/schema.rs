//! Workflow definition types — the request body submitted to the Backend API.
//!
//! A definition can be written in YAML or JSON:
//!
//! ```yaml
//! name: "release"
//! description: "Build and publish"
//! runner: "build-pool"
//!
//! variables:
//!   channel: "stable"
//!
//! steps:
//!   - name: "fetch"
//!     description: "Clone the repository"
//!     command: "git clone https://example.com/repo.git"
//!   - name: "build"
//!     command: "make release"
//!     depends: ["fetch"]
//!     with_files:
//!       Makefile: "build/Makefile"
//! ```
//!
//! Step fields other than `name`, `description` and `with_files` are kept
//! verbatim and forwarded to the server, which owns their meaning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// A workflow execution request: what gets POSTed to the Backend API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRequest {
    /// Workflow name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: String,

    /// Ordered list of steps; the order is the execution order contract
    pub steps: Vec<WorkflowStep>,

    /// Workflow-level variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Map<String, serde_json::Value>>,

    /// Preferred runner, overridden by an explicit runner argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
}

/// A single declared step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name (unique within the workflow)
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Files mounted into the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_files: Option<WithFiles>,

    /// Server-interpreted fields (command, executor, depends, output, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `with_files` is either a list of paths or a `destination -> source` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WithFiles {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            with_files: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl WorkflowExecutionRequest {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            variables: None,
            runner: None,
        }
    }

    /// Parse a definition from YAML (JSON is accepted too, being a YAML subset).
    pub fn from_yaml(yaml: &str) -> Result<Self, ExecutionError> {
        let request: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ExecutionError::Definition(format!("Failed to parse workflow: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    /// Load a definition from a file.
    pub fn from_file(path: &str) -> Result<Self, ExecutionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecutionError::Definition(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Non-empty workflow name and unique, non-empty step names.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.name.trim().is_empty() {
            return Err(ExecutionError::Definition("workflow name is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(ExecutionError::Definition("step with empty name".into()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ExecutionError::Definition(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }
        Ok(())
    }

    /// Index of the step called `name`, if declared.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// The request to submit when starting at `step`, and that step's index.
    ///
    /// Only `step` and the steps after it are kept; the name records where
    /// the run was started.
    pub fn from_step(&self, step: &str) -> Result<(usize, Self), ExecutionError> {
        let index = self
            .step_index(step)
            .ok_or_else(|| ExecutionError::StepNotFound(step.to_string()))?;
        let mut sliced = self.clone();
        sliced.steps = self.steps[index..].to_vec();
        sliced.name = format!("{} (from step {})", self.name, step);
        Ok((index, sliced))
    }

    /// Set a workflow variable, creating the map if needed.
    pub fn set_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.variables
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
    }
}
