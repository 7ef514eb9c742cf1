//! Core domain models

pub mod config;
pub mod loader;
pub mod pipeline;
pub mod settings;
pub mod state;

pub use config::{InputBinding, PipelineDefinition, StepConfig};
pub use loader::{DirectoryPipelineLoader, LoaderError, PipelineLoader, StaticPipelineLoader};
pub use settings::Settings;
pub use state::{
    LogEntry, LogLevel, QueueItem, RunMetadata, RunStatus, RunSummary, StepStatus, ValueMap,
};
