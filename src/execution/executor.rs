//! Step executor contract - how the runner invokes step implementations

use crate::core::ValueMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Error types for step loading and execution
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("step {step_id}@{version} not found")]
    NotFound { step_id: String, version: String },

    /// The step returned something other than `{"outputs": {...}}`
    #[error("invalid step result: {0}")]
    InvalidResult(String),

    /// The step implementation itself failed
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Description of a loadable step implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
    pub step_id: String,
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Declared input names (informational)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Declared output names (informational)
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Program and arguments, for out-of-process steps
    #[serde(default)]
    pub command: Vec<String>,
}

impl StepManifest {
    pub fn new(step_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            version: version.into(),
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            command: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Receives log lines emitted by a step while it runs.
/// Each call produces one durable log entry.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(&self, message: &str, metadata: Option<serde_json::Value>);
}

/// Trait for step execution - allows for different implementations
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Resolve a step implementation by id and version
    async fn load_manifest(&self, step_id: &str, version: &str) -> Result<StepManifest, ExecutorError>;

    /// Run a step with materialized inputs and return its outputs
    async fn execute(
        &self,
        manifest: &StepManifest,
        inputs: &ValueMap,
        logs: &dyn LogSink,
    ) -> Result<ValueMap, ExecutorError>;
}

/// Extract the `outputs` object from a raw step result
pub fn parse_step_result(result: serde_json::Value) -> Result<ValueMap, ExecutorError> {
    let serde_json::Value::Object(mut object) = result else {
        return Err(ExecutorError::InvalidResult("result is not an object".to_string()));
    };
    match object.remove("outputs") {
        Some(serde_json::Value::Object(outputs)) => Ok(outputs.into_iter().collect()),
        Some(other) => Err(ExecutorError::InvalidResult(format!(
            "outputs must be an object, got {}",
            json_type_name(&other)
        ))),
        None => Err(ExecutorError::InvalidResult("missing outputs".to_string())),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Log sink that keeps lines in memory
#[derive(Debug, Default)]
pub struct BufferedLogSink {
    lines: Mutex<Vec<(String, Option<serde_json::Value>)>>,
}

impl BufferedLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages logged so far
    pub fn messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for BufferedLogSink {
    async fn log(&self, message: &str, metadata: Option<serde_json::Value>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((message.to_string(), metadata));
        }
    }
}
