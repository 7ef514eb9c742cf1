//! Test: Success Chain - linear pipeline driven to completion

use crate::helpers::*;
use serde_json::json;
use tickflow::core::{QueueItem, RunStatus, StepStatus};
use tickflow::execution::{StepOutcome, StepRegistry};

/// echo then uppercase, one tick each
#[tokio::test]
async fn test_success_chain() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();

    let run = runner
        .create_run("sample", values(&[("text", json!("hello"))]), Some("ana".to_string()))
        .await
        .unwrap();
    assert_eq!(run.user_id.as_deref(), Some("ana"));
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Pending).await;
    assert_eq!(queued_steps(&runner, "sample", run.run_id).await, vec!["echo"]);

    // First tick: echo
    let report = runner.tick().await.unwrap().unwrap();
    assert_eq!(report.item.step_id, "echo");
    assert_eq!(
        report.outcome,
        StepOutcome::Succeeded {
            enqueued: vec!["uppercase".to_string()],
            run_completed: false,
        }
    );
    assert_eq!(
        store.read_step_output("sample", run.run_id, "echo").await.unwrap(),
        values(&[("text", json!("hello"))])
    );
    assert_eq!(queued_steps(&runner, "sample", run.run_id).await, vec!["uppercase"]);
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Running).await;

    // Second tick: uppercase
    let report = runner.tick().await.unwrap().unwrap();
    assert_eq!(report.item.step_id, "uppercase");
    assert!(matches!(report.outcome, StepOutcome::Succeeded { run_completed: true, .. }));
    assert_eq!(
        store.read_step_output("sample", run.run_id, "uppercase").await.unwrap(),
        values(&[("text", json!("HELLO"))])
    );
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Completed).await;

    assert_eq!(
        execution_order(store.as_ref(), "sample", run.run_id).await,
        vec!["echo", "uppercase"]
    );
}

/// Step-sourced inputs equal exactly the dependency's persisted output value
#[tokio::test]
async fn test_step_inputs_round_trip() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let run = runner
        .create_run("sample", values(&[("text", json!("round trip"))]), None)
        .await
        .unwrap();

    runner.drain(None).await.unwrap();

    let echo_out = store.read_step_output("sample", run.run_id, "echo").await.unwrap();
    let upper_in = store.read_step_input("sample", run.run_id, "uppercase").await.unwrap();
    assert_eq!(upper_in["text"], echo_out["text"]);

    let echo_in = store.read_step_input("sample", run.run_id, "echo").await.unwrap();
    assert_eq!(echo_in, values(&[("text", json!("round trip"))]));
}

/// A completed step is never executed again
#[tokio::test]
async fn test_completed_steps_are_not_rerun() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let run = runner
        .create_run("sample", values(&[("text", json!("once"))]), None)
        .await
        .unwrap();

    assert_eq!(runner.drain(None).await.unwrap().len(), 2);
    assert!(runner.tick().await.unwrap().is_none());

    // Resuming a finished run enqueues nothing
    assert!(runner.resume_run("sample", run.run_id).await.unwrap().is_empty());
    assert!(runner.tick().await.unwrap().is_none());

    for step in ["echo", "uppercase"] {
        assert_eq!(logs_with_prefix(store.as_ref(), "sample", run.run_id, step, "started").await.len(), 1);
    }
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Completed).await;
}

/// A duplicate item left behind the last step still lets the run complete
#[tokio::test]
async fn test_trailing_duplicate_completes_run() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let run = runner
        .create_run("sample", values(&[("text", json!("dup"))]), None)
        .await
        .unwrap();

    runner.tick().await.unwrap();
    store
        .append_queue_item(&QueueItem::new("sample", run.run_id, "uppercase"))
        .await
        .unwrap();
    assert_eq!(
        queued_steps(&runner, "sample", run.run_id).await,
        vec!["uppercase", "uppercase"]
    );

    // The duplicate is still queued, so the run stays open
    let report = runner.tick().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        StepOutcome::Succeeded {
            enqueued: vec![],
            run_completed: false,
        }
    );
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Running).await;

    let report = runner.tick().await.unwrap().unwrap();
    assert_eq!(report.item.step_id, "uppercase");
    assert!(matches!(report.outcome, StepOutcome::Skipped { .. }));
    assert!(queued_steps(&runner, "sample", run.run_id).await.is_empty());
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Completed).await;
    assert_eq!(
        logs_with_prefix(store.as_ref(), "sample", run.run_id, "uppercase", "started").await.len(),
        1
    );
}

/// Completed only once every step has output and nothing is queued
#[tokio::test]
async fn test_completion_detection_with_alias() {
    let yaml = r#"
id: aliased
steps:
  - step_id: echo
    version: "1.0.0"
    alias: first
    inputs:
      text: { source: pipeline, key: text }
  - step_id: echo
    version: "1.0.0"
    alias: second
    inputs:
      text: { source: step, step_id: first }
"#;
    let runner = runner(StepRegistry::with_builtins(), &[yaml]);
    let run = runner
        .create_run("aliased", values(&[("text", json!("twice"))]), None)
        .await
        .unwrap();

    runner.tick().await.unwrap();
    let summary = runner.run_summary("aliased", run.run_id).await.unwrap();
    assert_eq!(summary.metadata.status, RunStatus::Running);
    assert_eq!(
        summary.steps,
        vec![
            ("first".to_string(), StepStatus::Succeeded),
            ("second".to_string(), StepStatus::Queued { attempt: 1 }),
        ]
    );

    runner.tick().await.unwrap();
    let summary = runner.run_summary("aliased", run.run_id).await.unwrap();
    assert_eq!(summary.metadata.status, RunStatus::Completed);
    assert_eq!(summary.completed_steps(), 2);
    assert!((summary.progress() - 1.0).abs() < f64::EPSILON);
}

/// Runs are independent even when their items interleave in the global queue
#[tokio::test]
async fn test_interleaved_runs() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let a = runner.create_run("sample", values(&[("text", json!("a"))]), None).await.unwrap();
    let b = runner.create_run("sample", values(&[("text", json!("b"))]), None).await.unwrap();

    let order: Vec<_> = runner
        .drain(None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.item.run_id, r.item.step_id))
        .collect();
    assert_eq!(
        order,
        vec![
            (a.run_id, "echo".to_string()),
            (b.run_id, "echo".to_string()),
            (a.run_id, "uppercase".to_string()),
            (b.run_id, "uppercase".to_string()),
        ]
    );

    assert_eq!(
        store.read_step_output("sample", b.run_id, "uppercase").await.unwrap()["text"],
        json!("B")
    );
    assert_eq!(store.list_runs(Some("sample")).await.unwrap().len(), 2);
}
