//! Test: Fan-out and fan-in - independent roots and joins

use crate::helpers::*;
use serde_json::json;
use tickflow::core::RunStatus;
use tickflow::execution::StepRegistry;

const DIAMOND: &str = r#"
id: diamond
steps:
  - step_id: uppercase
    version: "1.0.0"
    alias: loud
    inputs:
      text: { source: pipeline, key: left }
  - step_id: concat
    version: "1.0.0"
    alias: join
    inputs:
      a: { source: step, step_id: loud, output: text }
      b: { source: step, step_id: quiet, output: text }
      separator: { source: pipeline, key: sep }
  - step_id: echo
    version: "1.0.0"
    alias: quiet
    inputs:
      text: { source: pipeline, key: right }
"#;

/// Independent roots are seeded in definition order
#[tokio::test]
async fn test_roots_seeded_in_definition_order() {
    let runner = runner(StepRegistry::with_builtins(), &[DIAMOND]);
    let run = runner
        .create_run(
            "diamond",
            values(&[("left", json!("hi")), ("right", json!("there")), ("sep", json!(" "))]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(queued_steps(&runner, "diamond", run.run_id).await, vec!["loud", "quiet"]);
}

/// The join waits for both branches, then runs exactly once
#[tokio::test]
async fn test_join_waits_for_all_dependencies() {
    let runner = runner(StepRegistry::with_builtins(), &[DIAMOND]);
    let store = runner.store().clone();
    let run = runner
        .create_run(
            "diamond",
            values(&[("left", json!("hi")), ("right", json!("there")), ("sep", json!(" "))]),
            None,
        )
        .await
        .unwrap();

    runner.tick().await.unwrap();
    assert_eq!(queued_steps(&runner, "diamond", run.run_id).await, vec!["quiet"]);

    runner.tick().await.unwrap();
    assert_eq!(queued_steps(&runner, "diamond", run.run_id).await, vec!["join"]);

    runner.tick().await.unwrap();
    assert_eq!(
        store.read_step_output("diamond", run.run_id, "join").await.unwrap()["text"],
        json!("HI there")
    );
    assert_run_status(&runner, "diamond", run.run_id, RunStatus::Completed).await;
    assert_eq!(
        execution_order(store.as_ref(), "diamond", run.run_id).await,
        vec!["loud", "quiet", "join"]
    );
}

/// A join with one branch blocked on a missing pipeline input never runs
#[tokio::test]
async fn test_partial_inputs_block_only_dependents() {
    let runner = runner(StepRegistry::with_builtins(), &[DIAMOND]);
    let run = runner
        .create_run("diamond", values(&[("left", json!("hi")), ("sep", json!("-"))]), None)
        .await
        .unwrap();

    assert_eq!(runner.drain(None).await.unwrap().len(), 1);
    let summary = runner.run_summary("diamond", run.run_id).await.unwrap();
    assert_eq!(summary.completed_steps(), 1);
    assert_eq!(summary.metadata.status, RunStatus::Running);
}
