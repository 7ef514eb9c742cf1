//! tickflow - a local-first, tick-driven workflow engine

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use core::{PipelineDefinition, QueueItem, RunMetadata, RunStatus, RunSummary, Settings, StepConfig, ValueMap};
pub use execution::{Runner, RunnerConfig, RunnerError, StepExecutor, StepOutcome, StepRegistry, TickReport};
#[cfg(feature = "sqlite")]
pub use persistence::SqliteRunStore;
pub use persistence::{InMemoryRunStore, RunStore, StoreError};
