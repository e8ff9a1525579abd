//! Rollback, archival and promotion atomicity.

mod common;

use std::sync::atomic::Ordering;

use common::{Harness, Scripted, agentic, human, md};
use gatehouse_core::definitions::FailureAction;
use gatehouse_core::{
    CommandStatus, ExecutionStatus, GatehouseError, RunStatus, status_of,
};

#[tokio::test]
async fn test_checkpoint_rollback_reopens_completed_run() {
    let h = Harness::new(vec![human("a"), human("b"), human("c")]);
    let run = h.completed_run().await.run;
    let executions = h.engine.list_executions(&run.id).unwrap();
    let removed: Vec<_> = executions[1..].iter().map(|e| e.id.clone()).collect();

    let event = h
        .engine
        .rollback_checkpoint(&run.id, 0, Some("redo the draft"))
        .await
        .unwrap();
    assert_eq!(event.items.deleted_executions, removed);
    assert!(event.items.deleted_runs.is_empty());
    assert_eq!(event.target_position, 0);
    assert_eq!(event.reason.as_deref(), Some("redo the draft"));

    let folder = h.root().join(&event.archive_location);
    assert!(folder.join("manifest.json").is_file());
    let data = folder.join("archived_data");
    assert!(data.join("v1/checkpoint_1_b/outputs/form_b_form_v1.json").is_file());
    assert!(data.join("v1/checkpoint_2_c/outputs/form_c_form_v1.json").is_file());
    assert!(data.join(format!("records/executions/{}.json", removed[0])).is_file());

    assert!(h.root().join("runs/v1/checkpoint_0_a").is_dir());
    assert!(!h.root().join("runs/v1/checkpoint_2_c").exists());

    // The run is live again and position 1 starts over.
    let summary = h.engine.get_run(&run.id).unwrap();
    assert_eq!(summary.run.status, RunStatus::InProgress);
    assert_eq!(summary.completed_checkpoints, 1);
    let next = summary.current_execution.unwrap();
    assert_eq!(next.checkpoint_position, 1);
    assert_eq!(next.status, ExecutionStatus::InProgress);
    assert!(!removed.contains(&next.id));

    let history = h.engine.rollback_history(Some(&run.id)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, event.id);
}

#[tokio::test]
async fn test_archival_failure_deletes_nothing() {
    let h = Harness::new(vec![human("a"), human("b")]);
    let run = h.completed_run().await.run;
    h.mirror.fail_copy_tree.store(true, Ordering::SeqCst);

    let result = h.engine.rollback_checkpoint(&run.id, 0, None).await;
    assert!(matches!(result, Err(GatehouseError::ArchivalFailure(_))));
    assert_eq!(status_of(&result), CommandStatus::Internal);

    assert_eq!(h.engine.list_executions(&run.id).unwrap().len(), 2);
    assert!(h.root().join("runs/v1/checkpoint_1_b/outputs").is_dir());
    assert_eq!(h.engine.get_run(&run.id).unwrap().run.status, RunStatus::Completed);
    assert!(h.engine.rollback_history(None).unwrap().is_empty());
    assert!(
        std::fs::read_dir(h.root().join(".archived"))
            .unwrap()
            .next()
            .is_none()
    );
}

#[tokio::test]
async fn test_repeated_rollbacks_use_separate_archives() {
    let h = Harness::new(vec![human("a"), human("b")]);
    let run = h.completed_run().await.run;

    let first = h.engine.rollback_checkpoint(&run.id, 0, None).await.unwrap();
    h.submit_current(&run.id).await;
    assert_eq!(h.engine.get_run(&run.id).unwrap().run.status, RunStatus::Completed);
    let second = h.engine.rollback_checkpoint(&run.id, 0, None).await.unwrap();

    assert_ne!(first.archive_location, second.archive_location);
    let name = "archived_data/v1/checkpoint_1_b/outputs/form_b_form_v1.json";
    assert!(h.root().join(&first.archive_location).join(name).is_file());
    assert!(h.root().join(&second.archive_location).join(name).is_file());

    let history = h.engine.rollback_history(None).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.id);
}

#[tokio::test]
async fn test_rollback_target_rules() {
    let h = Harness::new(vec![human("a"), human("b")]);
    let run = h.completed_run().await.run;

    let nothing = h.engine.rollback_checkpoint(&run.id, 1, None).await;
    assert_eq!(status_of(&nothing), CommandStatus::ValidationError);

    let missing = h.engine.rollback_checkpoint(&run.id, 7, None).await;
    assert_eq!(status_of(&missing), CommandStatus::Conflict);

    let unknown = h.engine.rollback_checkpoint("nope", 0, None).await;
    assert_eq!(status_of(&unknown), CommandStatus::NotFound);

    let points = h.engine.rollback_points(&run.id).unwrap();
    assert_eq!(points.len(), 2);
}

#[tokio::test]
async fn test_failed_checkpoint_recovers_through_rollback() {
    let mut draft = agentic("draft");
    draft.retry.on_failure = FailureAction::RollbackCheckpoint;
    let h = Harness::with_outcomes(
        vec![human("outline"), draft],
        vec![Scripted::Fail("bad output".into())],
    );
    let summary = h.started_run().await;
    let run_id = summary.run.id;
    h.submit_current(&run_id).await;
    assert_eq!(h.engine.get_run(&run_id).unwrap().run.status, RunStatus::Failed);

    h.engine.rollback_checkpoint(&run_id, 0, None).await.unwrap();

    // The queue is empty now, so the fresh execution succeeds.
    let summary = h.engine.get_run(&run_id).unwrap();
    assert_eq!(summary.run.status, RunStatus::Completed);
    assert_eq!(summary.completed_checkpoints, 2);
    assert_eq!(h.capability.calls(), 2);
}

#[tokio::test]
async fn test_promotion_failure_promotes_nothing() {
    let mut draft = agentic("draft");
    draft.requires_approval_to_complete = true;
    let h = Harness::with_outcomes(
        vec![draft],
        vec![Scripted::Produce(vec![md("body", "text"), md("summary", "short")])],
    );
    let summary = h.started_run().await;
    let id = summary.current_execution.unwrap().id;

    h.mirror.fail_nth_copy(2);
    let result = h.engine.approve_complete(&id).await;
    assert!(result.is_err());

    let execution = h.engine.get_execution(&id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::WaitingApprovalToComplete);
    let artifacts = h.engine.list_artifacts(&id).unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|a| !a.is_promoted()));
    let outputs = h.root().join("runs/v1/checkpoint_0_draft/outputs");
    let leftover = std::fs::read_dir(&outputs)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);

    h.mirror.fail_nth_copy(0);
    let done = h.engine.approve_complete(&id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(h.engine.list_artifacts(&id).unwrap().iter().all(|a| a.is_promoted()));
}

#[tokio::test]
async fn test_failed_first_checkpoint_reruns_after_rollback() {
    let h = Harness::with_outcomes(vec![agentic("draft")], vec![Scripted::Fail("boom".into())]);
    let run_id = h.started_run().await.run.id;
    let failed = h.current_execution_id(&run_id);
    assert_eq!(h.engine.get_execution(&failed).unwrap().status, ExecutionStatus::Failed);
    assert_eq!(h.engine.get_run(&run_id).unwrap().run.status, RunStatus::Paused);

    let stuck = h.engine.resume_run(&run_id).await;
    assert_eq!(status_of(&stuck), CommandStatus::Conflict);
    let points = h.engine.rollback_points(&run_id).unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].id, failed);

    let event = h.engine.rollback_checkpoint(&run_id, 0, None).await.unwrap();
    assert_eq!(event.items.deleted_executions, vec![failed.clone()]);
    let record = format!("archived_data/records/executions/{failed}.json");
    assert!(h.root().join(&event.archive_location).join(record).is_file());

    // Still paused, now with nothing to block the resume.
    let summary = h.engine.get_run(&run_id).unwrap();
    assert_eq!(summary.run.status, RunStatus::Paused);
    assert!(summary.current_execution.is_none());

    let resumed = h.engine.resume_run(&run_id).await.unwrap();
    assert_eq!(resumed.run.status, RunStatus::Completed);
    let executions = h.engine.list_executions(&run_id).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].checkpoint_position, 0);
    assert_ne!(executions[0].id, failed);
    assert_eq!(h.capability.calls(), 2);
}

#[tokio::test]
async fn test_failed_first_checkpoint_rollback_restarts_failed_run() {
    let mut draft = agentic("draft");
    draft.retry.on_failure = FailureAction::RollbackCheckpoint;
    let h = Harness::with_outcomes(vec![draft, human("review")], vec![Scripted::Fail("x".into())]);
    let run_id = h.started_run().await.run.id;
    assert_eq!(h.engine.get_run(&run_id).unwrap().run.status, RunStatus::Failed);

    h.engine.rollback_checkpoint(&run_id, 0, None).await.unwrap();

    let summary = h.engine.get_run(&run_id).unwrap();
    assert_eq!(summary.run.status, RunStatus::InProgress);
    assert_eq!(summary.completed_checkpoints, 1);
    let next = summary.current_execution.unwrap();
    assert_eq!(next.checkpoint_id, "review");
    assert_eq!(next.status, ExecutionStatus::InProgress);
}

#[tokio::test]
async fn test_unverified_archive_deletes_nothing() {
    let h = Harness::new(vec![human("a"), human("b")]);
    let run = h.completed_run().await.run;
    h.mirror.short_archives.store(true, Ordering::SeqCst);

    let result = h.engine.rollback_checkpoint(&run.id, 0, None).await;
    assert!(matches!(result, Err(GatehouseError::ArchivalFailure(_))));

    assert_eq!(h.engine.list_executions(&run.id).unwrap().len(), 2);
    assert!(h.root().join("runs/v1/checkpoint_1_b/outputs").is_dir());
    assert!(h.engine.rollback_history(None).unwrap().is_empty());
}
