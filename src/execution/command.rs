//! Subprocess step executor - runs steps as external commands
//!
//! Manifests live at `<steps_dir>/<step_id>/<version>/step.yaml` and name a
//! `command`. The step receives its inputs as a JSON object on stdin, may
//! write log lines to stderr (one log entry per line), and must print
//! `{"outputs": {...}}` on stdout before exiting with status 0.

use crate::core::ValueMap;
use crate::execution::executor::{parse_step_result, ExecutorError, LogSink, StepExecutor, StepManifest};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "step.yaml";

/// Executor that spawns one process per step execution
#[derive(Debug, Clone)]
pub struct CommandStepExecutor {
    steps_dir: PathBuf,
}

impl CommandStepExecutor {
    pub fn new(steps_dir: impl Into<PathBuf>) -> Self {
        Self {
            steps_dir: steps_dir.into(),
        }
    }

    fn step_dir(&self, step_id: &str, version: &str) -> Option<PathBuf> {
        let safe = |s: &str| !s.is_empty() && !s.contains(['/', '\\']) && s != "." && s != "..";
        if safe(step_id) && safe(version) {
            Some(self.steps_dir.join(step_id).join(version))
        } else {
            None
        }
    }

    fn read_manifest(path: &Path, step_id: &str, version: &str) -> Result<StepManifest, ExecutorError> {
        let content = std::fs::read_to_string(path).map_err(|_| ExecutorError::NotFound {
            step_id: step_id.to_string(),
            version: version.to_string(),
        })?;
        let mut manifest: StepManifest = serde_yaml::from_str(&content)
            .map_err(|e| ExecutorError::Failed(format!("invalid manifest {}: {}", path.display(), e)))?;

        // The directory layout is authoritative for identity
        manifest.step_id = step_id.to_string();
        manifest.version = version.to_string();

        if manifest.command.is_empty() {
            return Err(ExecutorError::Failed(format!(
                "manifest {} has an empty command",
                path.display()
            )));
        }
        Ok(manifest)
    }
}

#[async_trait]
impl StepExecutor for CommandStepExecutor {
    async fn load_manifest(&self, step_id: &str, version: &str) -> Result<StepManifest, ExecutorError> {
        let dir = self.step_dir(step_id, version).ok_or_else(|| ExecutorError::NotFound {
            step_id: step_id.to_string(),
            version: version.to_string(),
        })?;
        Self::read_manifest(&dir.join(MANIFEST_FILE), step_id, version)
    }

    async fn execute(
        &self,
        manifest: &StepManifest,
        inputs: &ValueMap,
        logs: &dyn LogSink,
    ) -> Result<ValueMap, ExecutorError> {
        let (program, args) = manifest
            .command
            .split_first()
            .ok_or_else(|| ExecutorError::Failed("empty command".to_string()))?;
        let workdir = self
            .step_dir(&manifest.step_id, &manifest.version)
            .ok_or_else(|| ExecutorError::NotFound {
                step_id: manifest.step_id.clone(),
                version: manifest.version.clone(),
            })?;
        let payload = serde_json::to_vec(inputs)
            .map_err(|e| ExecutorError::Failed(format!("failed to encode inputs: {}", e)))?;

        debug!("Spawning {} for step {}@{}", program, manifest.step_id, manifest.version);

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Failed(format!("failed to spawn {}: {}", program, e)))?;

        let (mut stdin, mut stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(ExecutorError::Failed("failed to capture step stdio".to_string())),
        };

        let write_inputs = async move {
            // A step that ignores stdin may close it early
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("step closed stdin early: {}", e);
            }
        };
        let read_outputs = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };
        let forward_logs = async {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => logs.log(&line, None).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("failed to read step stderr: {}", e);
                        break;
                    }
                }
            }
        };

        let ((), stdout_buf, ()) = tokio::join!(write_inputs, read_outputs, forward_logs);
        let stdout_buf =
            stdout_buf.map_err(|e| ExecutorError::Failed(format!("failed to read step output: {}", e)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutorError::Failed(format!("failed to wait for step: {}", e)))?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(ExecutorError::Failed(format!("step exited with code {}", code)));
        }

        let raw: serde_json::Value = serde_json::from_slice(&stdout_buf)
            .map_err(|e| ExecutorError::InvalidResult(format!("stdout is not JSON: {}", e)))?;
        parse_step_result(raw)
    }
}
