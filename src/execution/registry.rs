//! In-process step registry

use crate::core::ValueMap;
use crate::execution::executor::{parse_step_result, ExecutorError, LogSink, StepExecutor, StepManifest};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A step implementation living in the same process
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Returns the raw result, expected to be `{"outputs": {...}}`
    async fn run(&self, inputs: &ValueMap, logs: &dyn LogSink) -> Result<Value, String>;
}

/// Adapts a plain function into a handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&ValueMap) -> Result<Value, String> + Send + Sync,
{
    async fn run(&self, inputs: &ValueMap, _logs: &dyn LogSink) -> Result<Value, String> {
        (self.0)(inputs)
    }
}

struct Registered {
    manifest: StepManifest,
    handler: Arc<dyn StepHandler>,
}

/// Registry of step handlers keyed by `(step_id, version)`
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<(String, String), Registered>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with `echo`, `uppercase` and `concat` at version 1.0.0
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            StepManifest::new("echo", BUILTIN_VERSION)
                .with_description("Returns its `text` input unchanged")
                .with_inputs(&["text"])
                .with_outputs(&["text"]),
            Arc::new(Echo),
        );
        registry.register(
            StepManifest::new("uppercase", BUILTIN_VERSION)
                .with_description("Upper-cases its `text` input")
                .with_inputs(&["text"])
                .with_outputs(&["text"]),
            Arc::new(FnHandler(|inputs: &ValueMap| -> Result<Value, String> {
                let text = text_input(inputs, "text")?;
                Ok(json!({ "outputs": { "text": text.to_uppercase() } }))
            })),
        );
        registry.register(
            StepManifest::new("concat", BUILTIN_VERSION)
                .with_description("Joins every string input, in input-name order, with an optional `separator`")
                .with_outputs(&["text"]),
            Arc::new(FnHandler(|inputs: &ValueMap| -> Result<Value, String> {
                let separator = inputs.get("separator").and_then(Value::as_str).unwrap_or("");
                let parts: Vec<&str> = inputs
                    .iter()
                    .filter(|(name, _)| name.as_str() != "separator")
                    .filter_map(|(_, value)| value.as_str())
                    .collect();
                Ok(json!({ "outputs": { "text": parts.join(separator) } }))
            })),
        );
        registry
    }

    /// Register (or replace) a handler
    pub fn register(&mut self, manifest: StepManifest, handler: Arc<dyn StepHandler>) {
        let key = (manifest.step_id.clone(), manifest.version.clone());
        self.steps.insert(key, Registered { manifest, handler });
    }

    /// Builder-style registration of a plain function
    pub fn with_fn<F>(mut self, step_id: &str, version: &str, f: F) -> Self
    where
        F: Fn(&ValueMap) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(StepManifest::new(step_id, version), Arc::new(FnHandler(f)));
        self
    }

    fn lookup(&self, step_id: &str, version: &str) -> Result<&Registered, ExecutorError> {
        self.steps
            .get(&(step_id.to_string(), version.to_string()))
            .ok_or_else(|| ExecutorError::NotFound {
                step_id: step_id.to_string(),
                version: version.to_string(),
            })
    }
}

pub const BUILTIN_VERSION: &str = "1.0.0";

struct Echo;

#[async_trait]
impl StepHandler for Echo {
    async fn run(&self, inputs: &ValueMap, logs: &dyn LogSink) -> Result<Value, String> {
        let text = text_input(inputs, "text")?;
        logs.log(&format!("echoing {} chars", text.chars().count()), None).await;
        Ok(json!({ "outputs": { "text": text } }))
    }
}

fn text_input<'a>(inputs: &'a ValueMap, name: &str) -> Result<&'a str, String> {
    match inputs.get(name) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(format!("input '{}' must be a string", name)),
        None => Err(format!("missing input '{}'", name)),
    }
}

#[async_trait]
impl StepExecutor for StepRegistry {
    async fn load_manifest(&self, step_id: &str, version: &str) -> Result<StepManifest, ExecutorError> {
        Ok(self.lookup(step_id, version)?.manifest.clone())
    }

    async fn execute(
        &self,
        manifest: &StepManifest,
        inputs: &ValueMap,
        logs: &dyn LogSink,
    ) -> Result<ValueMap, ExecutorError> {
        let registered = self.lookup(&manifest.step_id, &manifest.version)?;
        debug!("Running in-process step {}@{}", manifest.step_id, manifest.version);

        let raw = registered
            .handler
            .run(inputs, logs)
            .await
            .map_err(ExecutorError::Failed)?;
        parse_step_result(raw)
    }
}
