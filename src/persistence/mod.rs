//! Persistence layer for run state and the global queue

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{LogEntry, QueueItem, RunMetadata, RunStatus, ValueMap};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Error types for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record was never written
    #[error("not found: {0}")]
    NotFound(String),

    /// A write-once record already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

fn run_key(pipeline_id: &str, run_id: Uuid) -> String {
    format!("run {}/{}", pipeline_id, run_id)
}

fn step_key(pipeline_id: &str, run_id: Uuid, step_id: &str, what: &str) -> String {
    format!("{} of step {}/{}/{}", what, pipeline_id, run_id, step_id)
}

/// Trait for run state backends
///
/// Every read of an absent record yields `StoreError::NotFound`, so callers
/// can tell "never written" from "written as empty".
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Create the run's metadata and immutable pipeline input bag
    async fn init_run(&self, metadata: &RunMetadata, pipeline_inputs: &ValueMap) -> Result<(), StoreError>;

    /// Load a run's metadata
    async fn load_run(&self, pipeline_id: &str, run_id: Uuid) -> Result<RunMetadata, StoreError>;

    /// List runs, newest first, optionally for a single pipeline
    async fn list_runs(&self, pipeline_id: Option<&str>) -> Result<Vec<RunMetadata>, StoreError>;

    /// Set a run's status and return the updated metadata
    async fn update_status(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<RunMetadata, StoreError>;

    async fn read_pipeline_inputs(&self, pipeline_id: &str, run_id: Uuid) -> Result<ValueMap, StoreError>;

    /// Persist the materialized inputs of a step (replaced on every attempt)
    async fn write_step_input(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
        inputs: &ValueMap,
    ) -> Result<(), StoreError>;

    async fn read_step_input(&self, pipeline_id: &str, run_id: Uuid, step_id: &str) -> Result<ValueMap, StoreError>;

    /// Persist a step's outputs. Write-once: the record marks the step completed.
    async fn write_step_output(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
        outputs: &ValueMap,
    ) -> Result<(), StoreError>;

    async fn read_step_output(&self, pipeline_id: &str, run_id: Uuid, step_id: &str) -> Result<ValueMap, StoreError>;

    /// Append an entry to a step's log stream
    async fn append_log(&self, pipeline_id: &str, run_id: Uuid, step_id: &str, entry: &LogEntry) -> Result<(), StoreError>;

    /// Read log entries in append order, optionally for a single step
    async fn read_logs(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: Option<&str>,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Execution names that have an output record
    async fn list_completed_steps(&self, pipeline_id: &str, run_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// Execution name -> output bag, for every completed step
    async fn load_all_outputs(&self, pipeline_id: &str, run_id: Uuid) -> Result<BTreeMap<String, ValueMap>, StoreError>;

    /// The whole global queue, oldest first
    async fn read_queue(&self) -> Result<Vec<QueueItem>, StoreError>;

    /// Replace the whole global queue
    async fn write_queue(&self, items: &[QueueItem]) -> Result<(), StoreError>;

    async fn append_queue_item(&self, item: &QueueItem) -> Result<(), StoreError>;

    /// Atomically remove and return the oldest item
    async fn pop_queue_item(&self) -> Result<Option<QueueItem>, StoreError>;
}

#[derive(Debug, Default)]
struct RunRecord {
    metadata: Option<RunMetadata>,
    pipeline_inputs: Option<ValueMap>,
    step_inputs: HashMap<String, ValueMap>,
    step_outputs: BTreeMap<String, ValueMap>,
    logs: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<(String, Uuid), RunRecord>,
    queue: VecDeque<QueueItem>,
}

impl MemoryState {
    fn run(&self, pipeline_id: &str, run_id: Uuid) -> Result<&RunRecord, StoreError> {
        self.runs
            .get(&(pipeline_id.to_string(), run_id))
            .ok_or_else(|| StoreError::NotFound(run_key(pipeline_id, run_id)))
    }

    fn run_mut(&mut self, pipeline_id: &str, run_id: Uuid) -> Result<&mut RunRecord, StoreError> {
        self.runs
            .get_mut(&(pipeline_id.to_string(), run_id))
            .ok_or_else(|| StoreError::NotFound(run_key(pipeline_id, run_id)))
    }
}

/// In-memory store (for testing or ephemeral use)
///
/// A single lock guards runs and queue, so every operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    state: RwLock<MemoryState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn init_run(&self, metadata: &RunMetadata, pipeline_inputs: &ValueMap) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let key = (metadata.pipeline_id.clone(), metadata.run_id);
        if state.runs.contains_key(&key) {
            return Err(StoreError::AlreadyExists(run_key(&metadata.pipeline_id, metadata.run_id)));
        }
        state.runs.insert(
            key,
            RunRecord {
                metadata: Some(metadata.clone()),
                pipeline_inputs: Some(pipeline_inputs.clone()),
                ..RunRecord::default()
            },
        );
        Ok(())
    }

    async fn load_run(&self, pipeline_id: &str, run_id: Uuid) -> Result<RunMetadata, StoreError> {
        let state = self.state.read().await;
        state
            .run(pipeline_id, run_id)?
            .metadata
            .clone()
            .ok_or_else(|| StoreError::NotFound(run_key(pipeline_id, run_id)))
    }

    async fn list_runs(&self, pipeline_id: Option<&str>) -> Result<Vec<RunMetadata>, StoreError> {
        let state = self.state.read().await;
        let mut runs: Vec<RunMetadata> = state
            .runs
            .values()
            .filter_map(|r| r.metadata.clone())
            .filter(|m| pipeline_id.is_none_or(|p| m.pipeline_id == p))
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn update_status(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<RunMetadata, StoreError> {
        let mut state = self.state.write().await;
        let record = state.run_mut(pipeline_id, run_id)?;
        let metadata = record
            .metadata
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(run_key(pipeline_id, run_id)))?;
        metadata.status = status;
        metadata.updated_at = Utc::now();
        Ok(metadata.clone())
    }

    async fn read_pipeline_inputs(&self, pipeline_id: &str, run_id: Uuid) -> Result<ValueMap, StoreError> {
        let state = self.state.read().await;
        state
            .run(pipeline_id, run_id)?
            .pipeline_inputs
            .clone()
            .ok_or_else(|| StoreError::NotFound(format!("inputs of {}", run_key(pipeline_id, run_id))))
    }

    async fn write_step_input(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
        inputs: &ValueMap,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .run_mut(pipeline_id, run_id)?
            .step_inputs
            .insert(step_id.to_string(), inputs.clone());
        Ok(())
    }

    async fn read_step_input(&self, pipeline_id: &str, run_id: Uuid, step_id: &str) -> Result<ValueMap, StoreError> {
        let state = self.state.read().await;
        state
            .run(pipeline_id, run_id)?
            .step_inputs
            .get(step_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(step_key(pipeline_id, run_id, step_id, "input")))
    }

    async fn write_step_output(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
        outputs: &ValueMap,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state.run_mut(pipeline_id, run_id)?;
        if record.step_outputs.contains_key(step_id) {
            return Err(StoreError::AlreadyExists(step_key(pipeline_id, run_id, step_id, "output")));
        }
        record.step_outputs.insert(step_id.to_string(), outputs.clone());
        Ok(())
    }

    async fn read_step_output(&self, pipeline_id: &str, run_id: Uuid, step_id: &str) -> Result<ValueMap, StoreError> {
        let state = self.state.read().await;
        state
            .run(pipeline_id, run_id)?
            .step_outputs
            .get(step_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(step_key(pipeline_id, run_id, step_id, "output")))
    }

    async fn append_log(&self, pipeline_id: &str, run_id: Uuid, step_id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut entry = entry.clone();
        entry.step_id = step_id.to_string();
        state.run_mut(pipeline_id, run_id)?.logs.push(entry);
        Ok(())
    }

    async fn read_logs(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: Option<&str>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .run(pipeline_id, run_id)?
            .logs
            .iter()
            .filter(|e| step_id.is_none_or(|s| e.step_id == s))
            .cloned()
            .collect())
    }

    async fn list_completed_steps(&self, pipeline_id: &str, run_id: Uuid) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        Ok(state.run(pipeline_id, run_id)?.step_outputs.keys().cloned().collect())
    }

    async fn load_all_outputs(&self, pipeline_id: &str, run_id: Uuid) -> Result<BTreeMap<String, ValueMap>, StoreError> {
        let state = self.state.read().await;
        Ok(state.run(pipeline_id, run_id)?.step_outputs.clone())
    }

    async fn read_queue(&self) -> Result<Vec<QueueItem>, StoreError> {
        let state = self.state.read().await;
        Ok(state.queue.iter().cloned().collect())
    }

    async fn write_queue(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.queue = items.iter().cloned().collect();
        Ok(())
    }

    async fn append_queue_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.queue.push_back(item.clone());
        Ok(())
    }

    async fn pop_queue_item(&self) -> Result<Option<QueueItem>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.queue.pop_front())
    }
}
