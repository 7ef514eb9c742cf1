//! Test: Subprocess Steps - steps run as external commands
#![cfg(unix)]

use crate::helpers::*;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tickflow::core::{RunStatus, StaticPipelineLoader};
use tickflow::execution::{CommandStepExecutor, Runner, RunnerConfig, StepOutcome};
use tickflow::persistence::InMemoryRunStore;

const WORDS: &str = r#"
id: words
steps:
  - step_id: count
    version: "1"
    inputs:
      text: { source: pipeline, key: text }
  - step_id: report
    version: "1"
    inputs:
      n: { source: step, step_id: count, output: words }
"#;

fn write_step(root: &Path, step_id: &str, script: &str) {
    let dir = root.join(step_id).join("1");
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = format!(
        "step_id: {}\nversion: \"1\"\ncommand: [sh, -c, {}]\n",
        step_id,
        serde_json::to_string(script).unwrap()
    );
    std::fs::write(dir.join("step.yaml"), manifest).unwrap();
}

fn runner_over(steps_dir: &Path, config: RunnerConfig) -> Runner {
    Runner::new(
        Arc::new(InMemoryRunStore::new()),
        Arc::new(CommandStepExecutor::new(steps_dir)),
        Arc::new(StaticPipelineLoader::new().with_pipeline(pipeline(WORDS))),
    )
    .with_config(config)
}

#[tokio::test]
async fn test_subprocess_pipeline_with_stderr_logs() {
    let steps = tempfile::tempdir().unwrap();
    write_step(
        steps.path(),
        "count",
        r#"cat > /dev/null; echo "counting" >&2; echo '{"outputs": {"words": 3}}'"#,
    );
    write_step(steps.path(), "report", r#"cat > /dev/null; echo '{"outputs": {"ok": true}}'"#);

    let runner = runner_over(steps.path(), RunnerConfig::default());
    let store = runner.store().clone();
    let run = runner
        .create_run("words", values(&[("text", json!("one two three"))]), None)
        .await
        .unwrap();

    runner.drain(None).await.unwrap();
    assert_run_status(&runner, "words", run.run_id, RunStatus::Completed).await;
    assert_eq!(
        store.read_step_input("words", run.run_id, "report").await.unwrap(),
        values(&[("n", json!(3))])
    );

    let messages: Vec<String> = store
        .read_logs("words", run.run_id, Some("count"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(messages, vec!["started", "counting", "completed"]);
}

/// A hung step is cut off by the timeout and treated as a failure
#[tokio::test]
async fn test_subprocess_timeout() {
    let steps = tempfile::tempdir().unwrap();
    write_step(steps.path(), "count", r#"sleep 5; echo '{"outputs": {"words": 1}}'"#);

    let runner = runner_over(
        steps.path(),
        RunnerConfig::new()
            .with_max_attempts(Some(1))
            .with_step_timeout(Some(std::time::Duration::from_millis(200))),
    );
    let run = runner
        .create_run("words", values(&[("text", json!("slow"))]), None)
        .await
        .unwrap();

    let report = runner.tick().await.unwrap().unwrap();
    assert!(matches!(
        report.outcome,
        StepOutcome::DeadLettered { attempts: 1, ref error } if error.starts_with("timed out")
    ));
    assert_run_status(&runner, "words", run.run_id, RunStatus::Failed).await;
}

/// Non-zero exits are retried like any other failure
#[tokio::test]
async fn test_subprocess_nonzero_exit() {
    let steps = tempfile::tempdir().unwrap();
    write_step(steps.path(), "count", "echo 'bad input' >&2; exit 2");

    let runner = runner_over(steps.path(), RunnerConfig::default());
    let store = runner.store().clone();
    let run = runner
        .create_run("words", values(&[("text", json!("x"))]), None)
        .await
        .unwrap();

    let report = runner.tick().await.unwrap().unwrap();
    assert!(matches!(report.outcome, StepOutcome::Retrying { next_attempt: 2, .. }));

    let failed = logs_with_prefix(store.as_ref(), "words", run.run_id, "count", "failed").await;
    assert_eq!(failed[0].message, "failed: step exited with code 2");
    assert_eq!(logs_with_prefix(store.as_ref(), "words", run.run_id, "count", "bad input").await.len(), 1);
}
