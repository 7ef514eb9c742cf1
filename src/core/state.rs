//! Run state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A bag of named values (pipeline inputs, step inputs, step outputs)
pub type ValueMap = BTreeMap<String, serde_json::Value>;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run was created, no step has been dequeued yet
    Pending,
    /// At least one step has been dequeued
    Running,
    /// Every step has an output record and nothing is queued for the run
    Completed,
    /// A step was dead-lettered or the run hit a definition error
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Check if no further transition is expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Durable metadata for one run of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run ID
    pub run_id: Uuid,

    /// Pipeline this run executes
    pub pipeline_id: String,

    /// Optional user tag supplied at creation
    pub user_id: Option<String>,

    /// Current status
    pub status: RunStatus,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When the status last changed
    pub updated_at: DateTime<Utc>,
}

impl RunMetadata {
    /// Create metadata for a fresh run
    pub fn new(pipeline_id: impl Into<String>, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            pipeline_id: pipeline_id.into(),
            user_id,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A durable record of "this step, in this run, is eligible to execute"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub pipeline_id: String,
    pub run_id: Uuid,
    /// Execution name of the step
    pub step_id: String,
    /// 1-based attempt number
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl QueueItem {
    pub fn new(pipeline_id: impl Into<String>, run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            run_id,
            step_id: step_id.into(),
            attempt: 1,
        }
    }

    /// Same item, scheduled for its next attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Check if the item belongs to the given run
    pub fn belongs_to(&self, pipeline_id: &str, run_id: Uuid) -> bool {
        self.pipeline_id == pipeline_id && self.run_id == run_id
    }
}

/// Severity of a step log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// One timestamped record in a step's log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub step_id: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(step_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step_id: step_id.into(),
            level,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn info(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_id, LogLevel::Info, message)
    }

    pub fn error(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_id, LogLevel::Error, message)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Derived status of a single step within a run. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum StepStatus {
    /// Output record exists
    Succeeded,
    /// Sitting in the queue
    Queued { attempt: u32 },
    /// Neither queued nor completed (dependencies unmet, or dead-lettered)
    Waiting,
}

/// Per-run view used for inspection
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub metadata: RunMetadata,
    /// Execution names in definition order with their derived status
    pub steps: Vec<(String, StepStatus)>,
}

impl RunSummary {
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|(_, status)| *status == StepStatus::Succeeded)
            .count()
    }

    /// Progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.completed_steps() as f64 / self.steps.len() as f64
    }
}
