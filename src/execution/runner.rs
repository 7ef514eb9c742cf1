//! Run orchestrator - creates runs and drives them one tick at a time

use crate::{
    core::{
        InputBinding, LoaderError, LogEntry, PipelineDefinition, PipelineLoader, QueueItem, RunMetadata,
        RunStatus, RunSummary, Settings, StepConfig, StepStatus, ValueMap,
    },
    execution::{
        executor::{ExecutorError, LogSink, StepExecutor},
        resolver::{compute_runnable_steps, RunSnapshot},
    },
    persistence::{RunStore, StoreError},
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error types that abort a tick
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("step {step} is not part of pipeline {pipeline_id}")]
    StepNotInPipeline { pipeline_id: String, step: String },

    #[error("manifest for {step_id}@{version} not found")]
    ManifestNotFound { step_id: String, version: String },

    #[error("failed to load manifest for step {step}: {source}")]
    Manifest {
        step: String,
        #[source]
        source: ExecutorError,
    },

    #[error("step {step} depends on {dependency}, which has no output record")]
    MissingDependency { step: String, dependency: String },

    #[error("input {input} of step {step} has no value")]
    MissingInput { step: String, input: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunnerError {
    /// Errors caused by the pipeline definition or step catalogue rather than storage
    pub fn is_definition_error(&self) -> bool {
        !matches!(self, RunnerError::Store(_))
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Attempts per queue item before it is dead-lettered; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Upper bound on a single step execution; `None` waits forever
    pub step_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            step_timeout: None,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new()
            .with_max_attempts(settings.max_attempts)
            .with_step_timeout(settings.step_timeout_secs.map(Duration::from_secs))
    }
}

/// What happened to the item processed by a tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Outputs were persisted
    Succeeded {
        /// Downstream execution names newly enqueued
        enqueued: Vec<String>,
        run_completed: bool,
    },
    /// Execution failed and the item went back on the queue
    Retrying { next_attempt: u32, error: String },
    /// Execution failed for the last allowed time; the run is now failed
    DeadLettered { attempts: u32, error: String },
    /// The step already has an output record, or its run already failed
    Skipped { reason: String },
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub item: QueueItem,
    pub outcome: StepOutcome,
}

/// Persists log lines emitted by a running step
struct StoreLogSink<'a> {
    store: &'a dyn RunStore,
    pipeline_id: &'a str,
    run_id: Uuid,
    step_id: &'a str,
}

#[async_trait]
impl<'a> LogSink for StoreLogSink<'a> {
    async fn log(&self, message: &str, metadata: Option<serde_json::Value>) {
        let mut entry = LogEntry::info(self.step_id, message);
        entry.metadata = metadata;
        if let Err(e) = self
            .store
            .append_log(self.pipeline_id, self.run_id, self.step_id, &entry)
            .await
        {
            warn!("Failed to persist log line for step {}: {}", self.step_id, e);
        }
    }
}

/// Resolve every binding of `step` to a concrete value
pub fn materialize_inputs(
    step: &StepConfig,
    pipeline_inputs: &ValueMap,
    outputs: &BTreeMap<String, ValueMap>,
) -> Result<ValueMap, RunnerError> {
    let mut values = ValueMap::new();
    for (name, binding) in &step.inputs {
        let value = match binding {
            InputBinding::Pipeline { key } => pipeline_inputs.get(key),
            InputBinding::Step { step_id, .. } => {
                let bag = outputs
                    .get(step_id)
                    .ok_or_else(|| RunnerError::MissingDependency {
                        step: step.execution_name().to_string(),
                        dependency: step_id.clone(),
                    })?;
                bag.get(binding.output_key(name).unwrap_or(name))
            }
        };
        let value = value.ok_or_else(|| RunnerError::MissingInput {
            step: step.execution_name().to_string(),
            input: name.clone(),
        })?;
        values.insert(name.clone(), value.clone());
    }
    Ok(values)
}

/// Main run orchestrator
///
/// `tick` is serialized in-process; across processes the store's atomic pop
/// keeps workers from claiming the same item.
pub struct Runner {
    store: Arc<dyn RunStore>,
    executor: Arc<dyn StepExecutor>,
    loader: Arc<dyn PipelineLoader>,
    config: RunnerConfig,
    tick_lock: Mutex<()>,
}

impl Runner {
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: Arc<dyn StepExecutor>,
        loader: Arc<dyn PipelineLoader>,
    ) -> Self {
        Self {
            store,
            executor,
            loader,
            config: RunnerConfig::default(),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Create a run and seed the queue with its immediately runnable steps
    pub async fn create_run(
        &self,
        pipeline_id: &str,
        initial_inputs: ValueMap,
        user_id: Option<String>,
    ) -> Result<RunMetadata, RunnerError> {
        let _guard = self.tick_lock.lock().await;
        let pipeline = self.loader.load(pipeline_id)?;
        let metadata = RunMetadata::new(pipeline_id, user_id);
        self.store.init_run(&metadata, &initial_inputs).await?;

        let empty = HashSet::new();
        let no_outputs = BTreeMap::new();
        let seeded = compute_runnable_steps(
            &pipeline,
            &RunSnapshot {
                completed_steps: &empty,
                enqueued_steps: &empty,
                available_outputs: &no_outputs,
                pipeline_inputs: &initial_inputs,
            },
        );
        for step in &seeded {
            self.store
                .append_queue_item(&QueueItem::new(pipeline_id, metadata.run_id, step))
                .await?;
        }

        info!(
            "Created run {} of {} ({} step(s) enqueued)",
            metadata.run_id,
            pipeline_id,
            seeded.len()
        );
        Ok(metadata)
    }

    /// Pop and fully execute at most one queue item
    pub async fn tick(&self) -> Result<Option<TickReport>, RunnerError> {
        let _guard = self.tick_lock.lock().await;

        let Some(item) = self.store.pop_queue_item().await? else {
            debug!("Queue is empty");
            return Ok(None);
        };
        debug!(
            "Dequeued {} of run {} (attempt {})",
            item.step_id, item.run_id, item.attempt
        );

        match self.execute_item(&item).await {
            Ok(outcome) => Ok(Some(TickReport { item, outcome })),
            Err(err) => {
                error!("Tick for step {} of run {} aborted: {}", item.step_id, item.run_id, err);
                if err.is_definition_error() {
                    // The item is consumed, so the run can never complete
                    self.fail_run(&item, &err.to_string()).await;
                }
                Err(err)
            }
        }
    }

    /// Tick until the queue is empty or `max_ticks` items were processed
    pub async fn drain(&self, max_ticks: Option<usize>) -> Result<Vec<TickReport>, RunnerError> {
        let mut reports = Vec::new();
        while max_ticks.is_none_or(|max| reports.len() < max) {
            match self.tick().await? {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        Ok(reports)
    }

    async fn execute_item(&self, item: &QueueItem) -> Result<StepOutcome, RunnerError> {
        let pipeline_id = item.pipeline_id.as_str();
        let run_id = item.run_id;
        let name = item.step_id.as_str();

        let metadata = self.store.load_run(pipeline_id, run_id).await?;
        if metadata.status == RunStatus::Failed {
            warn!("Skipping {} of run {}: run already failed", name, run_id);
            return Ok(StepOutcome::Skipped {
                reason: "run already failed".to_string(),
            });
        }

        let pipeline = self.loader.load(pipeline_id)?;
        let pipeline_inputs = self.store.read_pipeline_inputs(pipeline_id, run_id).await?;
        let enqueued = self.enqueued_steps(pipeline_id, run_id).await?;
        let outputs = self.store.load_all_outputs(pipeline_id, run_id).await?;

        if outputs.contains_key(name) {
            warn!("Skipping {} of run {}: output already recorded", name, run_id);
            // The duplicate may have been the last item holding the run open
            if !metadata.status.is_terminal() {
                self.complete_if_done(&pipeline, pipeline_id, run_id).await?;
            }
            return Ok(StepOutcome::Skipped {
                reason: "output already recorded".to_string(),
            });
        }

        let step = pipeline
            .step(name)
            .ok_or_else(|| RunnerError::StepNotInPipeline {
                pipeline_id: pipeline_id.to_string(),
                step: name.to_string(),
            })?;
        let manifest = self
            .executor
            .load_manifest(&step.step_id, &step.version)
            .await
            .map_err(|e| match e {
                ExecutorError::NotFound { step_id, version } => RunnerError::ManifestNotFound { step_id, version },
                other => RunnerError::Manifest {
                    step: name.to_string(),
                    source: other,
                },
            })?;

        if metadata.status != RunStatus::Running {
            self.store
                .update_status(pipeline_id, run_id, RunStatus::Running)
                .await?;
        }

        let inputs = materialize_inputs(step, &pipeline_inputs, &outputs)?;
        self.store
            .write_step_input(pipeline_id, run_id, name, &inputs)
            .await?;
        self.store
            .append_log(
                pipeline_id,
                run_id,
                name,
                &LogEntry::info(name, "started").with_metadata(json!({
                    "event": "started",
                    "attempt": item.attempt,
                    "step_id": step.step_id,
                    "version": step.version,
                })),
            )
            .await?;
        info!(
            "Executing {} ({}@{}) for run {}, attempt {}",
            name, step.step_id, step.version, run_id, item.attempt
        );

        let sink = StoreLogSink {
            store: self.store.as_ref(),
            pipeline_id,
            run_id,
            step_id: name,
        };
        let execution = self.executor.execute(&manifest, &inputs, &sink);
        let result = match self.config.step_timeout {
            Some(limit) => timeout(limit, execution)
                .await
                .unwrap_or(Err(ExecutorError::Timeout(limit))),
            None => execution.await,
        };

        match result {
            Ok(step_outputs) => {
                self.on_success(&pipeline, item, &pipeline_inputs, enqueued, step_outputs)
                    .await
            }
            Err(err) => self.on_failure(item, err).await,
        }
    }

    async fn on_success(
        &self,
        pipeline: &PipelineDefinition,
        item: &QueueItem,
        pipeline_inputs: &ValueMap,
        mut enqueued: HashSet<String>,
        step_outputs: ValueMap,
    ) -> Result<StepOutcome, RunnerError> {
        let pipeline_id = item.pipeline_id.as_str();
        let run_id = item.run_id;
        let name = item.step_id.as_str();

        self.store
            .write_step_output(pipeline_id, run_id, name, &step_outputs)
            .await?;
        self.store
            .append_log(
                pipeline_id,
                run_id,
                name,
                &LogEntry::info(name, "completed").with_metadata(json!({
                    "event": "completed",
                    "attempt": item.attempt,
                    "outputs": step_outputs.keys().collect::<Vec<_>>(),
                })),
            )
            .await?;
        info!("Step {} of run {} completed", name, run_id);

        let outputs = self.store.load_all_outputs(pipeline_id, run_id).await?;
        let completed: HashSet<String> = outputs.keys().cloned().collect();
        let newly_runnable = compute_runnable_steps(
            pipeline,
            &RunSnapshot {
                completed_steps: &completed,
                enqueued_steps: &enqueued,
                available_outputs: &outputs,
                pipeline_inputs,
            },
        );
        for next in &newly_runnable {
            self.store
                .append_queue_item(&QueueItem::new(pipeline_id, run_id, next))
                .await?;
            enqueued.insert(next.clone());
            debug!("Enqueued {} for run {}", next, run_id);
        }

        let run_completed = self.complete_if_done(pipeline, pipeline_id, run_id).await?;
        Ok(StepOutcome::Succeeded {
            enqueued: newly_runnable,
            run_completed,
        })
    }

    async fn on_failure(&self, item: &QueueItem, err: ExecutorError) -> Result<StepOutcome, RunnerError> {
        let pipeline_id = item.pipeline_id.as_str();
        let run_id = item.run_id;
        let name = item.step_id.as_str();
        let message = err.to_string();

        warn!(
            "Step {} of run {} failed on attempt {}: {}",
            name, run_id, item.attempt, message
        );
        self.store
            .append_log(
                pipeline_id,
                run_id,
                name,
                &LogEntry::error(name, format!("failed: {}", message)).with_metadata(json!({
                    "event": "failed",
                    "attempt": item.attempt,
                    "error": message,
                })),
            )
            .await?;

        let exhausted = self
            .config
            .max_attempts
            .is_some_and(|max| item.attempt >= max);
        if !exhausted {
            let retry = item.next_attempt();
            self.store.append_queue_item(&retry).await?;
            return Ok(StepOutcome::Retrying {
                next_attempt: retry.attempt,
                error: message,
            });
        }

        error!(
            "Step {} of run {} dead-lettered after {} attempt(s)",
            name, run_id, item.attempt
        );
        self.store
            .append_log(
                pipeline_id,
                run_id,
                name,
                &LogEntry::error(name, format!("dead-lettered after {} attempt(s)", item.attempt))
                    .with_metadata(json!({ "event": "dead_lettered", "attempts": item.attempt })),
            )
            .await?;
        self.purge_run_items(pipeline_id, run_id).await?;
        self.store
            .update_status(pipeline_id, run_id, RunStatus::Failed)
            .await?;

        Ok(StepOutcome::DeadLettered {
            attempts: item.attempt,
            error: message,
        })
    }

    /// Mark the run completed when every step has an output and nothing is queued for it
    async fn complete_if_done(
        &self,
        pipeline: &PipelineDefinition,
        pipeline_id: &str,
        run_id: Uuid,
    ) -> Result<bool, RunnerError> {
        let completed: HashSet<String> = self
            .store
            .list_completed_steps(pipeline_id, run_id)
            .await?
            .into_iter()
            .collect();
        let remaining = pipeline
            .execution_names()
            .into_iter()
            .filter(|name| !completed.contains(*name))
            .count();
        if remaining > 0 {
            debug!("Run {} has {} step(s) remaining", run_id, remaining);
            return Ok(false);
        }

        if !self.enqueued_steps(pipeline_id, run_id).await?.is_empty() {
            return Ok(false);
        }

        self.store
            .update_status(pipeline_id, run_id, RunStatus::Completed)
            .await?;
        info!("Run {} of {} completed", run_id, pipeline_id);
        Ok(true)
    }

    /// Re-derive eligibility from persisted state and enqueue anything runnable
    /// that is neither completed nor queued.
    ///
    /// Recovers items lost when a worker died between pop and output write,
    /// and revives a failed run.
    pub async fn resume_run(&self, pipeline_id: &str, run_id: Uuid) -> Result<Vec<String>, RunnerError> {
        let _guard = self.tick_lock.lock().await;

        let metadata = self.store.load_run(pipeline_id, run_id).await?;
        let pipeline = self.loader.load(pipeline_id)?;
        let pipeline_inputs = self.store.read_pipeline_inputs(pipeline_id, run_id).await?;
        let enqueued = self.enqueued_steps(pipeline_id, run_id).await?;
        let outputs = self.store.load_all_outputs(pipeline_id, run_id).await?;
        let completed: HashSet<String> = outputs.keys().cloned().collect();

        let runnable = compute_runnable_steps(
            &pipeline,
            &RunSnapshot {
                completed_steps: &completed,
                enqueued_steps: &enqueued,
                available_outputs: &outputs,
                pipeline_inputs: &pipeline_inputs,
            },
        );
        for step in &runnable {
            self.store
                .append_queue_item(&QueueItem::new(pipeline_id, run_id, step))
                .await?;
        }

        if !runnable.is_empty() && metadata.status == RunStatus::Failed {
            self.store
                .update_status(pipeline_id, run_id, RunStatus::Running)
                .await?;
        } else if runnable.is_empty() && metadata.status != RunStatus::Completed {
            self.complete_if_done(&pipeline, pipeline_id, run_id).await?;
        }

        info!(
            "Resumed run {} of {} ({} step(s) enqueued)",
            run_id,
            pipeline_id,
            runnable.len()
        );
        Ok(runnable)
    }

    /// Metadata plus the derived status of every step, in definition order
    pub async fn run_summary(&self, pipeline_id: &str, run_id: Uuid) -> Result<RunSummary, RunnerError> {
        let metadata = self.store.load_run(pipeline_id, run_id).await?;
        let pipeline = self.loader.load(pipeline_id)?;
        let completed: HashSet<String> = self
            .store
            .list_completed_steps(pipeline_id, run_id)
            .await?
            .into_iter()
            .collect();
        let queued: HashMap<String, u32> = self
            .store
            .read_queue()
            .await?
            .into_iter()
            .filter(|i| i.belongs_to(pipeline_id, run_id))
            .map(|i| (i.step_id, i.attempt))
            .collect();

        let steps = pipeline
            .execution_names()
            .into_iter()
            .map(|name| {
                let status = if completed.contains(name) {
                    StepStatus::Succeeded
                } else if let Some(attempt) = queued.get(name) {
                    StepStatus::Queued { attempt: *attempt }
                } else {
                    StepStatus::Waiting
                };
                (name.to_string(), status)
            })
            .collect();

        Ok(RunSummary { metadata, steps })
    }

    async fn enqueued_steps(&self, pipeline_id: &str, run_id: Uuid) -> Result<HashSet<String>, RunnerError> {
        Ok(self
            .store
            .read_queue()
            .await?
            .into_iter()
            .filter(|i| i.belongs_to(pipeline_id, run_id))
            .map(|i| i.step_id)
            .collect())
    }

    /// Drop every queued item of a run
    async fn purge_run_items(&self, pipeline_id: &str, run_id: Uuid) -> Result<(), RunnerError> {
        let queue = self.store.read_queue().await?;
        let before = queue.len();
        let kept: Vec<QueueItem> = queue
            .into_iter()
            .filter(|i| !i.belongs_to(pipeline_id, run_id))
            .collect();
        if kept.len() != before {
            self.store.write_queue(&kept).await?;
            debug!("Purged {} queued item(s) of run {}", before - kept.len(), run_id);
        }
        Ok(())
    }

    async fn fail_run(&self, item: &QueueItem, reason: &str) {
        let entry = LogEntry::error(&item.step_id, format!("aborted: {}", reason))
            .with_metadata(json!({ "event": "aborted", "attempt": item.attempt }));
        if let Err(e) = self
            .store
            .append_log(&item.pipeline_id, item.run_id, &item.step_id, &entry)
            .await
        {
            warn!("Failed to record abort of run {}: {}", item.run_id, e);
        }
        if let Err(e) = self
            .store
            .update_status(&item.pipeline_id, item.run_id, RunStatus::Failed)
            .await
        {
            warn!("Failed to mark run {} as failed: {}", item.run_id, e);
        }
    }
}
