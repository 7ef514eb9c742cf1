//! Resolves pipeline identifiers to definitions

use crate::core::config::PipelineDefinition;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Error types for pipeline loading
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("pipeline not found: {0}")]
    NotFound(String),

    #[error("invalid pipeline definition {pipeline_id}: {source}")]
    Invalid {
        pipeline_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Trait for pipeline definition sources
pub trait PipelineLoader: Send + Sync {
    fn load(&self, pipeline_id: &str) -> Result<PipelineDefinition, LoaderError>;
}

/// Loads `<dir>/<pipeline_id>.yaml` (or `.yml`)
#[derive(Debug, Clone)]
pub struct DirectoryPipelineLoader {
    dir: PathBuf,
}

impl DirectoryPipelineLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidate(&self, pipeline_id: &str) -> Option<PathBuf> {
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", pipeline_id, ext)))
            .find(|path| path.is_file())
    }
}

impl PipelineLoader for DirectoryPipelineLoader {
    fn load(&self, pipeline_id: &str) -> Result<PipelineDefinition, LoaderError> {
        // Keep lookups inside the directory
        if pipeline_id.contains(['/', '\\']) || pipeline_id.starts_with('.') {
            return Err(LoaderError::NotFound(pipeline_id.to_string()));
        }

        let path = self
            .candidate(pipeline_id)
            .ok_or_else(|| LoaderError::NotFound(pipeline_id.to_string()))?;
        debug!("Loading pipeline {} from {}", pipeline_id, path.display());

        let definition =
            PipelineDefinition::from_file(&path).map_err(|source| LoaderError::Invalid {
                pipeline_id: pipeline_id.to_string(),
                source,
            })?;

        if definition.id != pipeline_id {
            return Err(LoaderError::Invalid {
                pipeline_id: pipeline_id.to_string(),
                source: anyhow::anyhow!(
                    "file declares id '{}' but is named '{}'",
                    definition.id,
                    pipeline_id
                ),
            });
        }

        Ok(definition)
    }
}

/// Fixed set of definitions held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticPipelineLoader {
    pipelines: HashMap<String, PipelineDefinition>,
}

impl StaticPipelineLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, definition: PipelineDefinition) -> Self {
        self.pipelines.insert(definition.id.clone(), definition);
        self
    }
}

impl PipelineLoader for StaticPipelineLoader {
    fn load(&self, pipeline_id: &str) -> Result<PipelineDefinition, LoaderError> {
        self.pipelines
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(pipeline_id.to_string()))
    }
}
