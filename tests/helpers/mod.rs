//! Test utility functions for tickflow

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tickflow::core::{LogEntry, PipelineDefinition, RunStatus, StaticPipelineLoader, ValueMap};
use tickflow::execution::{LogSink, Runner, RunnerConfig, StepHandler, StepManifest, StepRegistry};
use tickflow::persistence::{InMemoryRunStore, RunStore};
use uuid::Uuid;

pub const SAMPLE_PIPELINE: &str = r#"
id: sample
name: Sample pipeline
steps:
  - step_id: echo
    version: "1.0.0"
    alias: echo
    inputs:
      text: { source: pipeline, key: text }
  - step_id: uppercase
    version: "1.0.0"
    alias: uppercase
    inputs:
      text: { source: step, step_id: echo, output: text }
"#;

pub const FLAKY_PIPELINE: &str = r#"
id: flaky
steps:
  - step_id: flaky
    version: "1"
    inputs:
      text: { source: pipeline, key: text }
"#;

pub fn pipeline(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml(yaml).unwrap()
}

/// Build a value map from literal pairs
pub fn values(pairs: &[(&str, Value)]) -> ValueMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Runner over an in-memory store with the given registry and pipelines
pub fn runner(registry: StepRegistry, pipelines: &[&str]) -> Runner {
    runner_with_config(registry, pipelines, RunnerConfig::default())
}

pub fn runner_with_config(registry: StepRegistry, pipelines: &[&str], config: RunnerConfig) -> Runner {
    let loader = pipelines
        .iter()
        .fold(StaticPipelineLoader::new(), |loader, yaml| loader.with_pipeline(pipeline(yaml)));
    Runner::new(Arc::new(InMemoryRunStore::new()), Arc::new(registry), Arc::new(loader)).with_config(config)
}

/// Handler that fails a fixed number of times before succeeding
pub struct FlakyStep {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyStep {
    pub fn new(failures: usize) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                failures,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl StepHandler for FlakyStep {
    async fn run(&self, inputs: &ValueMap, logs: &dyn LogSink) -> Result<Value, String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(format!("transient failure #{}", call + 1));
        }
        logs.log("recovered", Some(json!({ "call": call + 1 }))).await;
        Ok(json!({ "outputs": inputs }))
    }
}

/// Registry with the builtins plus a `flaky@1` step
pub fn registry_with_flaky(failures: usize) -> (StepRegistry, Arc<AtomicUsize>) {
    let (flaky, calls) = FlakyStep::new(failures);
    let mut registry = StepRegistry::with_builtins();
    registry.register(StepManifest::new("flaky", "1"), Arc::new(flaky));
    (registry, calls)
}

pub async fn assert_run_status(runner: &Runner, pipeline_id: &str, run_id: Uuid, expected: RunStatus) {
    let metadata = runner.store().load_run(pipeline_id, run_id).await.unwrap();
    assert_eq!(
        metadata.status, expected,
        "run {} expected {:?}, got {:?}",
        run_id, expected, metadata.status
    );
}

/// Execution names of the run's queued items, in queue order
pub async fn queued_steps(runner: &Runner, pipeline_id: &str, run_id: Uuid) -> Vec<String> {
    runner
        .store()
        .read_queue()
        .await
        .unwrap()
        .into_iter()
        .filter(|item| item.belongs_to(pipeline_id, run_id))
        .map(|item| item.step_id)
        .collect()
}

/// Log entries of one step whose message starts with `prefix`
pub async fn logs_with_prefix(
    store: &dyn RunStore,
    pipeline_id: &str,
    run_id: Uuid,
    step: &str,
    prefix: &str,
) -> Vec<LogEntry> {
    store
        .read_logs(pipeline_id, run_id, Some(step))
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.message.starts_with(prefix))
        .collect()
}

/// Execution names in the order their first attempt started
pub async fn execution_order(store: &dyn RunStore, pipeline_id: &str, run_id: Uuid) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for entry in store.read_logs(pipeline_id, run_id, None).await.unwrap() {
        if entry.message == "started" && !order.contains(&entry.step_id) {
            order.push(entry.step_id);
        }
    }
    order
}
