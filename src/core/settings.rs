//! Engine settings loaded from an optional YAML file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine-wide settings
///
/// Every field is optional in the file; missing fields fall back to defaults
/// rooted at the platform data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where the run database lives
    pub data_dir: PathBuf,

    /// Directory holding `<pipeline_id>.yaml` definitions
    pub pipelines_dir: PathBuf,

    /// Directory holding `<step_id>/<version>/step.yaml` manifests.
    /// When unset, only the built-in steps are available.
    pub steps_dir: Option<PathBuf>,

    /// Maximum attempts per queue item; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Per-step timeout in seconds; `None` waits forever
    pub step_timeout_secs: Option<u64>,

    /// Idle delay between polls in `work` mode
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tickflow");
        Self {
            pipelines_dir: data_dir.join("pipelines"),
            data_dir,
            steps_dir: None,
            max_attempts: Some(3),
            step_timeout_secs: None,
            poll_interval_ms: 500,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse settings from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml).context("Invalid settings file")?;
        if settings.max_attempts == Some(0) {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(settings)
    }

    /// Path of the SQLite run database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("runs.db")
    }
}
