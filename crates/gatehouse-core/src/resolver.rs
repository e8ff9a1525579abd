//! Run lineage and cross-version artifact references.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::definitions::CheckpointDefinition;
use crate::store::{self, Store};
use crate::types::{Artifact, CheckpointExecution, InputContext, InteractionKind, PipelineRun};
use crate::{GatehouseError, Result};

#[derive(Clone)]
pub struct VersionResolver {
    store: Arc<Store>,
}

impl VersionResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Highest run version not deleted by a rollback.
    pub fn latest_valid_run(&self, pipeline_id: &str) -> Result<Option<PipelineRun>> {
        self.store.read(|c| store::latest_valid_run(c, pipeline_id))
    }

    /// Promoted artifacts at `position` of the run's previous version.
    ///
    /// Empty when the run has no predecessor, or the predecessor no longer
    /// exists.
    pub fn resolve_previous_version_artifacts(
        &self,
        run_id: &str,
        position: i64,
    ) -> Result<Vec<Artifact>> {
        self.store.read(|c| {
            let run = store::get_run(c, run_id)?;
            let Some(previous_id) = run.previous_run_id.as_deref() else {
                return Ok(Vec::new());
            };
            match store::get_run(c, previous_id) {
                Ok(_) => store::promoted_artifacts_at(c, previous_id, position),
                Err(GatehouseError::NotFound { .. }) => {
                    warn!(run_id, previous_id, "previous run no longer exists");
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Promoted artifacts of an earlier checkpoint in the same run.
    ///
    /// Fails with `UnmetDependency` when that checkpoint has not completed.
    pub fn resolve_referenced_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<Artifact>> {
        self.store.read(|c| {
            let execution = store::find_completed_execution(c, run_id, checkpoint_id)?.ok_or_else(
                || GatehouseError::UnmetDependency {
                    run_id: run_id.to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                },
            )?;
            Ok(store::list_artifacts(c, &execution.id)?
                .into_iter()
                .filter(Artifact::is_promoted)
                .collect())
        })
    }

    /// Assemble everything an execution receives as input.
    pub fn build_input_context(
        &self,
        execution: &CheckpointExecution,
        checkpoint: &CheckpointDefinition,
    ) -> Result<InputContext> {
        let previous_version = if checkpoint.inputs.include_previous_version {
            self.resolve_previous_version_artifacts(
                &execution.run_id,
                execution.checkpoint_position,
            )?
        } else {
            Vec::new()
        };

        let mut checkpoint_outputs = BTreeMap::new();
        for referenced in &checkpoint.inputs.include_checkpoint_outputs {
            let artifacts = self.resolve_referenced_checkpoint(&execution.run_id, referenced)?;
            checkpoint_outputs.insert(referenced.clone(), artifacts);
        }

        let revision_feedback = if execution.revision_iteration > 0 {
            self.store.read(|c| {
                Ok(store::list_interactions(c, &execution.id)?
                    .into_iter()
                    .rev()
                    .find(|i| i.kind == InteractionKind::RevisionRequest)
                    .and_then(|i| i.feedback))
            })?
        } else {
            None
        };

        debug!(
            execution_id = %execution.id,
            previous = previous_version.len(),
            referenced = checkpoint_outputs.len(),
            "built input context"
        );
        Ok(InputContext {
            previous_version,
            checkpoint_outputs,
            revision_feedback,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use chrono::Utc;

    use super::*;
    use crate::types::{ArtifactFormat, ExecutionStatus, RunStatus};

    fn run(id: &str, version: i64, previous: Option<&str>) -> PipelineRun {
        PipelineRun {
            id: id.into(),
            pipeline_id: "p".into(),
            run_version: version,
            status: RunStatus::InProgress,
            current_checkpoint_id: None,
            current_position: None,
            previous_run_id: previous.map(str::to_string),
            extends_from_run_version: None,
            definition_version: 1,
            checkpoint_order: vec!["a".into(), "b".into()],
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            last_resumed_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    fn execution(id: &str, run_id: &str, checkpoint: &str, position: i64) -> CheckpointExecution {
        CheckpointExecution {
            id: id.into(),
            run_id: run_id.into(),
            checkpoint_id: checkpoint.into(),
            checkpoint_name: checkpoint.into(),
            checkpoint_position: position,
            status: ExecutionStatus::Completed,
            attempt_number: 1,
            revision_iteration: 0,
            temp_workspace_path: PathBuf::from(format!(".temp/exec_{id}")),
            permanent_output_path: PathBuf::new(),
            form_data: None,
            last_error: None,
            failure_action: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: Some(Utc::now()),
            failed_at: None,
        }
    }

    fn promoted(store: &Store, execution_id: &str, run_id: &str, artifact_id: &str) {
        let artifact = Artifact {
            id: artifact_id.into(),
            execution_id: execution_id.into(),
            run_id: run_id.into(),
            name: artifact_id.into(),
            format: ArtifactFormat::Txt,
            size_bytes: 1,
            checksum: "c".into(),
            staged_path: PathBuf::from("s"),
            promoted_path: None,
            promoted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .write(|tx| {
                store::upsert_staged_artifact(tx, &artifact, b"x")?;
                store::mark_promoted(
                    tx,
                    execution_id,
                    artifact_id,
                    Path::new("p"),
                    1,
                    "c",
                    &Utc::now(),
                )
            })
            .unwrap();
    }

    fn setup() -> (Arc<Store>, VersionResolver) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let snapshot = CheckpointDefinition::human("a");
        store
            .write(|tx| {
                store::insert_run(tx, &run("r1", 1, None))?;
                store::insert_run(tx, &run("r2", 2, Some("r1")))?;
                store::insert_execution(tx, &execution("e1", "r1", "a", 0), &snapshot)?;
                store::insert_execution(tx, &execution("e2", "r2", "a", 0), &snapshot)
            })
            .unwrap();
        promoted(&store, "e1", "r1", "v1_out");
        promoted(&store, "e2", "r2", "v2_out");
        (store.clone(), VersionResolver::new(store))
    }

    #[test]
    fn test_previous_version_artifacts() {
        let (_store, resolver) = setup();
        let found = resolver.resolve_previous_version_artifacts("r2", 0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "v1_out");
        assert!(resolver.resolve_previous_version_artifacts("r1", 0).unwrap().is_empty());
        assert!(resolver.resolve_previous_version_artifacts("r2", 1).unwrap().is_empty());
    }

    #[test]
    fn test_referenced_checkpoint_unmet() {
        let (_store, resolver) = setup();
        let found = resolver.resolve_referenced_checkpoint("r2", "a").unwrap();
        assert_eq!(found[0].id, "v2_out");

        let err = resolver.resolve_referenced_checkpoint("r2", "b").unwrap_err();
        assert!(matches!(
            err,
            GatehouseError::UnmetDependency { ref checkpoint_id, .. } if checkpoint_id == "b"
        ));
    }

    #[test]
    fn test_input_context_carries_feedback() {
        let (store, resolver) = setup();
        store
            .write(|tx| {
                for feedback in ["first", "second"] {
                    store::insert_interaction(
                        tx,
                        "e2",
                        InteractionKind::RevisionRequest,
                        Some(feedback),
                        None,
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let mut exec = execution("e2", "r2", "b", 1);
        exec.revision_iteration = 2;
        let mut checkpoint = CheckpointDefinition::human("b");
        checkpoint.inputs.include_previous_version = true;
        checkpoint.inputs.include_checkpoint_outputs = vec!["a".into()];

        let context = resolver.build_input_context(&exec, &checkpoint).unwrap();
        assert!(context.previous_version.is_empty());
        assert_eq!(context.checkpoint_outputs["a"].len(), 1);
        assert_eq!(context.revision_feedback.as_deref(), Some("second"));
    }

    #[test]
    fn test_latest_valid_run() {
        let (_store, resolver) = setup();
        assert_eq!(resolver.latest_valid_run("p").unwrap().unwrap().id, "r2");
        assert!(resolver.latest_valid_run("other").unwrap().is_none());
    }
}
