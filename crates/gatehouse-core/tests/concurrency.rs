//! Commands racing an executor call that is still running.

mod common;

use std::time::Duration;

use common::{Gate, Harness, Scripted, agentic, human, md};
use gatehouse_core::{CommandStatus, ExecutionStatus, RunStatus, status_of};
use tokio::time::timeout;

const PROMPT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_returns_while_executor_runs() {
    let gate = Gate::new();
    let h = Harness::with_outcomes(
        vec![agentic("draft"), human("review")],
        vec![Scripted::Park(gate.clone())],
    );
    let run = h.engine.create_run(None).await.unwrap();

    let start = {
        let engine = h.engine.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move { engine.start_run(&run_id).await })
    };
    gate.entered().await;

    let paused = timeout(PROMPT, h.engine.pause_run(&run.id))
        .await
        .expect("pause blocked behind the executor call")
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    gate.open();
    let summary = timeout(PROMPT, start).await.unwrap().unwrap().unwrap();

    // The call's output lands, but the paused run does not move on.
    assert_eq!(summary.run.status, RunStatus::Paused);
    let executions = h.engine.list_executions(&run.id).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(h.engine.list_artifacts(&executions[0].id).unwrap().len(), 1);

    let resumed = h.engine.resume_run(&run.id).await.unwrap();
    assert_eq!(resumed.run.status, RunStatus::InProgress);
    assert_eq!(resumed.current_execution.unwrap().checkpoint_id, "review");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rollback_refuses_runs_with_executor_in_flight() {
    let gate = Gate::new();
    let h = Harness::with_outcomes(
        vec![human("outline"), agentic("draft")],
        vec![
            Scripted::Produce(vec![md("draft", "v1")]),
            Scripted::Park(gate.clone()),
        ],
    );
    let v1 = h.started_run().await.run;
    h.submit_current(&v1.id).await;
    assert_eq!(h.engine.get_run(&v1.id).unwrap().run.status, RunStatus::Completed);

    let v2 = h.engine.create_run(None).await.unwrap();
    h.engine.start_run(&v2.id).await.unwrap();
    let outline = h.current_execution_id(&v2.id);
    let submit = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .submit_form_data(&outline, serde_json::json!({ "topic": "rust" }))
                .await
        })
    };
    gate.entered().await;
    let draft = h.current_execution_id(&v2.id);

    let across = timeout(PROMPT, h.engine.rollback_run(&v2.id, &v1.id, 1, None))
        .await
        .unwrap();
    assert_eq!(status_of(&across), CommandStatus::Conflict);
    let within = timeout(PROMPT, h.engine.rollback_checkpoint(&v2.id, 0, None))
        .await
        .unwrap();
    assert_eq!(status_of(&within), CommandStatus::Conflict);
    let report = h.engine.report_success(&draft, vec![md("draft", "early")]).await;
    assert_eq!(status_of(&report), CommandStatus::Conflict);

    assert_eq!(h.engine.list_runs().unwrap().len(), 2);
    assert!(h.engine.rollback_history(None).unwrap().is_empty());

    gate.open();
    timeout(PROMPT, submit).await.unwrap().unwrap().unwrap();
    let finished = h.engine.get_run(&v2.id).unwrap();
    assert_eq!(finished.run.status, RunStatus::Completed);
    assert_eq!(finished.completed_checkpoints, 2);

    // Once the call is done the same rollback goes through.
    let event = h.engine.rollback_run(&v2.id, &v1.id, 1, None).await.unwrap();
    assert_eq!(event.items.deleted_runs, vec![v2.id.clone()]);
    assert_eq!(h.engine.list_runs().unwrap().len(), 1);
}
