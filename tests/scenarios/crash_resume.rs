//! Test: Crash Resume - recovering items lost between pop and output write

use crate::helpers::*;
use serde_json::json;
use tickflow::core::{RunStatus, StepStatus};
use tickflow::execution::StepRegistry;
use tickflow::persistence::StoreError;

/// Worker died after popping: the item is gone until the run is resumed
#[tokio::test]
async fn test_resume_after_lost_item() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let run = runner
        .create_run("sample", values(&[("text", json!("lost"))]), None)
        .await
        .unwrap();

    let lost = store.pop_queue_item().await.unwrap().unwrap();
    assert_eq!(lost.step_id, "echo");
    assert!(runner.tick().await.unwrap().is_none());
    let summary = runner.run_summary("sample", run.run_id).await.unwrap();
    assert_eq!(summary.steps[0].1, StepStatus::Waiting);

    assert_eq!(runner.resume_run("sample", run.run_id).await.unwrap(), vec!["echo"]);
    // A second resume sees the item already queued
    assert!(runner.resume_run("sample", run.run_id).await.unwrap().is_empty());

    runner.drain(None).await.unwrap();
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Completed).await;
}

/// Worker died after writing output but before enqueueing dependents
#[tokio::test]
async fn test_resume_after_output_written() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let run = runner
        .create_run("sample", values(&[("text", json!("half"))]), None)
        .await
        .unwrap();

    store.pop_queue_item().await.unwrap().unwrap();
    store
        .write_step_output("sample", run.run_id, "echo", &values(&[("text", json!("half"))]))
        .await
        .unwrap();

    assert_eq!(runner.resume_run("sample", run.run_id).await.unwrap(), vec!["uppercase"]);
    runner.drain(None).await.unwrap();

    // echo was never re-executed
    assert!(logs_with_prefix(store.as_ref(), "sample", run.run_id, "echo", "started").await.is_empty());
    assert_eq!(
        store.read_step_output("sample", run.run_id, "uppercase").await.unwrap()["text"],
        json!("HALF")
    );
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Completed).await;
}

/// Every step already has output: resume only settles the status
#[tokio::test]
async fn test_resume_marks_finished_run_completed() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let store = runner.store().clone();
    let run = runner
        .create_run("sample", values(&[("text", json!("done"))]), None)
        .await
        .unwrap();

    store.pop_queue_item().await.unwrap().unwrap();
    for (step, text) in [("echo", "done"), ("uppercase", "DONE")] {
        store
            .write_step_output("sample", run.run_id, step, &values(&[("text", json!(text))]))
            .await
            .unwrap();
    }

    assert!(runner.resume_run("sample", run.run_id).await.unwrap().is_empty());
    assert_run_status(&runner, "sample", run.run_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn test_resume_unknown_run() {
    let runner = runner(StepRegistry::with_builtins(), &[SAMPLE_PIPELINE]);
    let err = runner
        .resume_run("sample", uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, tickflow::execution::RunnerError::Store(StoreError::NotFound(_))));
}

/// Run state survives reopening the database
#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_run_survives_restart() {
    use std::sync::Arc;
    use tickflow::core::StaticPipelineLoader;
    use tickflow::execution::Runner;
    use tickflow::persistence::SqliteRunStore;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runs.db");
    let open = |store: SqliteRunStore| {
        Runner::new(
            Arc::new(store),
            Arc::new(StepRegistry::with_builtins()),
            Arc::new(StaticPipelineLoader::new().with_pipeline(pipeline(SAMPLE_PIPELINE))),
        )
    };

    let run_id = {
        let runner = open(SqliteRunStore::new(&db).await.unwrap());
        let run = runner
            .create_run("sample", values(&[("text", json!("durable"))]), None)
            .await
            .unwrap();
        runner.tick().await.unwrap().unwrap();
        run.run_id
    };

    let runner = open(SqliteRunStore::new(&db).await.unwrap());
    let summary = runner.run_summary("sample", run_id).await.unwrap();
    assert_eq!(summary.metadata.status, RunStatus::Running);
    assert_eq!(
        summary.steps,
        vec![
            ("echo".to_string(), StepStatus::Succeeded),
            ("uppercase".to_string(), StepStatus::Queued { attempt: 1 }),
        ]
    );

    runner.drain(None).await.unwrap();
    assert_eq!(
        runner.store().read_step_output("sample", run_id, "uppercase").await.unwrap()["text"],
        json!("DURABLE")
    );
    assert_run_status(&runner, "sample", run_id, RunStatus::Completed).await;
}
