//! Run lifecycle: `not_started → in_progress ⇄ paused → completed`, with
//! `failed` reachable from `in_progress`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::definitions::{DefinitionSource, FailureAction};
use crate::execution::ExecutionMachine;
use crate::mirror::{self, Mirror};
use crate::store::{self, Store};
use crate::types::{CheckpointExecution, ExecutionStatus, PipelineRun, RunStatus, RunSummary};
use crate::{GatehouseError, Result};

/// Contents of `runs/v{N}/run_info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub pipeline_id: String,
    pub run_version: i64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub previous_run_id: Option<String>,
    pub extends_from_run_version: Option<i64>,
}

impl From<&PipelineRun> for RunInfo {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id.clone(),
            pipeline_id: run.pipeline_id.clone(),
            run_version: run.run_version,
            status: run.status,
            created_at: run.created_at,
            previous_run_id: run.previous_run_id.clone(),
            extends_from_run_version: run.extends_from_run_version,
        }
    }
}

#[derive(Clone)]
pub struct RunManager {
    store: Arc<Store>,
    mirror: Arc<dyn Mirror>,
    artifacts: ArtifactStore,
    definitions: Arc<dyn DefinitionSource>,
    machine: ExecutionMachine,
}

impl RunManager {
    pub fn new(
        store: Arc<Store>,
        mirror: Arc<dyn Mirror>,
        artifacts: ArtifactStore,
        definitions: Arc<dyn DefinitionSource>,
        machine: ExecutionMachine,
    ) -> Self {
        Self {
            store,
            mirror,
            artifacts,
            definitions,
            machine,
        }
    }

    /// Allocate the next run version of a pipeline.
    ///
    /// Without `extends_from_run_id` the run builds on the latest valid run.
    pub fn create_run(
        &self,
        pipeline_id: &str,
        extends_from_run_id: Option<&str>,
    ) -> Result<PipelineRun> {
        let pipeline = self.definitions.pipeline(pipeline_id)?;
        if pipeline.order.is_empty() {
            return Err(GatehouseError::InvalidPipelineState(format!(
                "pipeline '{pipeline_id}' has no checkpoints"
            )));
        }
        self.check_input_references(&pipeline.order)?;

        let run = self.store.write(|tx| {
            let previous = match extends_from_run_id {
                Some(base_id) => {
                    let base = store::get_run(tx, base_id)?;
                    if base.pipeline_id != pipeline_id {
                        return Err(GatehouseError::invalid_field(
                            "extends_from_run_id",
                            format!("run {base_id} belongs to pipeline '{}'", base.pipeline_id),
                        ));
                    }
                    Some(base)
                }
                None => store::latest_valid_run(tx, pipeline_id)?,
            };

            let run = PipelineRun {
                id: uuid::Uuid::new_v4().to_string(),
                pipeline_id: pipeline_id.to_string(),
                run_version: store::max_run_version(tx, pipeline_id)? + 1,
                status: RunStatus::NotStarted,
                current_checkpoint_id: None,
                current_position: None,
                previous_run_id: previous.as_ref().map(|p| p.id.clone()),
                extends_from_run_version: previous.as_ref().map(|p| p.run_version),
                definition_version: pipeline.definition_version,
                checkpoint_order: pipeline.order.clone(),
                created_at: Utc::now(),
                started_at: None,
                paused_at: None,
                last_resumed_at: None,
                completed_at: None,
                failed_at: None,
            };
            store::insert_run(tx, &run)?;
            store::insert_event(
                tx,
                Some(&run.id),
                "run_created",
                &format!("created run v{}", run.run_version),
            )?;
            Ok(run)
        })?;

        let layout = self.mirror.layout();
        self.mirror.create_dir(&layout.run_dir(run.run_version))?;
        self.write_run_info(&run);
        self.mirror.point_latest(Some(run.run_version))?;

        info!(
            run_id = %run.id,
            version = run.run_version,
            extends = ?run.extends_from_run_version,
            "created run"
        );
        Ok(run)
    }

    /// Every `include_checkpoint_outputs` entry must name an earlier checkpoint.
    fn check_input_references(&self, order: &[String]) -> Result<()> {
        for (position, checkpoint_id) in order.iter().enumerate() {
            let checkpoint = self.definitions.checkpoint(checkpoint_id)?;
            for referenced in &checkpoint.inputs.include_checkpoint_outputs {
                match order.iter().position(|id| id == referenced) {
                    Some(p) if p < position => {}
                    _ => {
                        return Err(GatehouseError::InvalidPipelineState(format!(
                            "checkpoint '{checkpoint_id}' uses outputs of '{referenced}', \
                             which does not run before it"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Start a run and create the execution for position 0.
    pub fn start_run(&self, run_id: &str) -> Result<CheckpointExecution> {
        let mut run = self.get(run_id)?;
        expect_run_status(&run, RunStatus::NotStarted)?;

        run.status = RunStatus::InProgress;
        run.started_at = Some(Utc::now());
        let execution = self.machine.create(&mut run, 0, false)?;
        self.record_event(&run, "run_started", "run started")?;
        self.write_run_info(&run);
        info!(run_id, "run started");
        Ok(execution)
    }

    /// Block creation of the next execution. In-flight work continues.
    pub fn pause_run(&self, run_id: &str) -> Result<PipelineRun> {
        let mut run = self.get(run_id)?;
        expect_run_status(&run, RunStatus::InProgress)?;
        run.status = RunStatus::Paused;
        run.paused_at = Some(Utc::now());
        self.save(&run, "run_paused", "run paused")?;
        info!(run_id, "run paused");
        Ok(run)
    }

    /// Resume a paused run, creating the next execution if the current one
    /// already completed.
    pub fn resume_run(&self, run_id: &str) -> Result<Option<CheckpointExecution>> {
        let mut run = self.get(run_id)?;
        expect_run_status(&run, RunStatus::Paused)?;

        if let Some(current) = self.store.read(|c| store::current_execution(c, run_id))?
            && current.status == ExecutionStatus::Failed
        {
            return Err(GatehouseError::conflict(format!(
                "checkpoint '{}' failed; roll back to position {} before resuming",
                current.checkpoint_id, current.checkpoint_position
            )));
        }

        run.status = RunStatus::InProgress;
        run.last_resumed_at = Some(Utc::now());
        self.save(&run, "run_resumed", "run resumed")?;
        info!(run_id, "run resumed");
        self.advance(run_id)
    }

    /// Move past a completed execution.
    ///
    /// Creates the next pending execution, or completes the run after the
    /// last position. A started run with no executions left (its first one
    /// failed and was rolled back) starts over at position 0. Does nothing
    /// while the run is paused or the current execution is unfinished. The
    /// completed execution's temp workspace is removed once its successor
    /// exists or the run completed.
    pub fn advance(&self, run_id: &str) -> Result<Option<CheckpointExecution>> {
        let mut run = self.get(run_id)?;
        if run.status != RunStatus::InProgress {
            debug!(run_id, status = %run.status, "not advancing");
            return Ok(None);
        }
        let Some(current) = self.store.read(|c| store::current_execution(c, run_id))? else {
            let first = self.machine.create(&mut run, 0, false)?;
            self.write_run_info(&run);
            return Ok(Some(first));
        };
        if current.status != ExecutionStatus::Completed {
            return Ok(None);
        }

        let next_position = current.checkpoint_position + 1;
        if next_position < run.total_checkpoints() {
            let gate_start = !self.definitions.pipeline(&run.pipeline_id)?.auto_advance;
            let next = self.machine.create(&mut run, next_position, gate_start)?;
            self.remove_workspace(&current);
            return Ok(Some(next));
        }

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        self.save(&run, "run_completed", "all checkpoints completed")?;
        self.remove_workspace(&current);
        info!(run_id, version = run.run_version, "run completed");
        Ok(None)
    }

    /// Apply a terminal execution failure to the run.
    pub fn on_execution_failed(&self, run_id: &str, action: FailureAction) -> Result<PipelineRun> {
        let mut run = self.get(run_id)?;
        if !matches!(run.status, RunStatus::InProgress | RunStatus::Paused) {
            return Ok(run);
        }
        let now = Utc::now();
        match action {
            FailureAction::PausePipeline => {
                run.status = RunStatus::Paused;
                run.paused_at = Some(now);
                self.save(&run, "run_paused", "paused after checkpoint failure")?;
            }
            FailureAction::RollbackCheckpoint => {
                run.status = RunStatus::Failed;
                run.failed_at = Some(now);
                self.save(&run, "run_failed", "checkpoint failed; awaiting rollback")?;
            }
        }
        warn!(run_id, status = %run.status, "run stopped by checkpoint failure");
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Result<PipelineRun> {
        self.store.read(|c| store::get_run(c, run_id))
    }

    pub fn summary(&self, run_id: &str) -> Result<RunSummary> {
        self.store.read(|c| {
            let run = store::get_run(c, run_id)?;
            Ok(RunSummary {
                completed_checkpoints: store::count_completed(c, run_id)?,
                total_checkpoints: run.total_checkpoints(),
                current_execution: store::current_execution(c, run_id)?,
                run,
            })
        })
    }

    pub fn list_runs(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
        self.store.read(|c| store::list_runs(c, pipeline_id))
    }

    /// Look a run up by id, `v{N}` or bare version number.
    pub fn find(&self, pipeline_id: &str, reference: &str) -> Result<PipelineRun> {
        let version = crate::layout::parse_run_dir_name(reference)
            .or_else(|| reference.parse::<i64>().ok());
        match version {
            Some(v) => self
                .store
                .read(|c| store::find_run_by_version(c, pipeline_id, v))?
                .ok_or_else(|| GatehouseError::not_found("run", reference)),
            None => self.get(reference),
        }
    }

    fn save(&self, run: &PipelineRun, kind: &str, description: &str) -> Result<()> {
        self.store.write(|tx| {
            store::update_run(tx, run)?;
            store::insert_event(tx, Some(&run.id), kind, description)
        })?;
        self.write_run_info(run);
        Ok(())
    }

    fn record_event(&self, run: &PipelineRun, kind: &str, description: &str) -> Result<()> {
        self.store
            .write(|tx| store::insert_event(tx, Some(&run.id), kind, description))
    }

    /// Refresh `run_info.json`. The file is derived; failures only warn.
    pub(crate) fn write_run_info(&self, run: &PipelineRun) {
        let path = self.mirror.layout().run_info_path(run.run_version);
        if let Err(e) = mirror::write_json(self.mirror.as_ref(), &path, &RunInfo::from(run)) {
            warn!(run_id = %run.id, error = %e, "failed to write run_info.json");
        }
    }

    fn remove_workspace(&self, execution: &CheckpointExecution) {
        if let Err(e) = self.artifacts.delete_temp(&execution.id) {
            warn!(execution_id = %execution.id, error = %e, "failed to delete temp workspace");
        }
    }
}

fn expect_run_status(run: &PipelineRun, expected: RunStatus) -> Result<()> {
    if run.status == expected {
        Ok(())
    } else {
        Err(GatehouseError::conflict(format!(
            "run {} is {}, expected {}",
            run.id, run.status, expected
        )))
    }
}
