//! Destructive rollback with archive-before-delete.
//!
//! A rollback runs in four phases:
//!
//! 1. copy every affected run directory, checkpoint directory and temp
//!    workspace into `.archived/rollback_{id}_{datetime}/archived_data/`,
//!    together with JSON snapshots of every row about to be deleted;
//! 2. verify the copies (present, same size);
//! 3. in one transaction, record the rollback event and its archived items
//!    and delete the rows;
//! 4. remove the original files.
//!
//! A failure in phase 1 or 2 removes the partial archive and leaves the
//! store of record and the mirror untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::layout::{ARCHIVED_DATA_DIR, run_dir_name};
use crate::mirror::{self, Mirror};
use crate::store::{self, Store};
use crate::types::{
    ArchivedItem, ArchivedItemType, Artifact, CheckpointExecution, ExecutionStatus, PipelineRun,
    RollbackEvent, RollbackKind, RollbackTrigger, RolledBackItems, RunStatus,
};
use crate::{GatehouseError, Result};

const RECORDS_DIR: &str = "records";
const TEMP_ARCHIVE_DIR: &str = "temp";
const MANIFEST_FILE: &str = "manifest.json";

/// Rows and files one rollback removes.
struct RollbackPlan {
    kind: RollbackKind,
    source: PipelineRun,
    target_run: PipelineRun,
    target: CheckpointExecution,
    /// The target itself failed and is deleted so its position runs again.
    retries_target: bool,
    /// Runs deleted wholesale, with their executions and artifacts.
    runs: Vec<(PipelineRun, Vec<CheckpointExecution>, Vec<Artifact>)>,
    /// Executions of the target run after the target position, and the
    /// target itself when it failed.
    truncated: Vec<(CheckpointExecution, Vec<Artifact>)>,
    reason: Option<String>,
}

impl RollbackPlan {
    fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.truncated.is_empty()
    }

    fn items(&self) -> RolledBackItems {
        let mut items = RolledBackItems::default();
        for (run, executions, artifacts) in &self.runs {
            items.deleted_runs.push(run.id.clone());
            items
                .deleted_executions
                .extend(executions.iter().map(|e| e.id.clone()));
            items
                .archived_artifacts
                .extend(artifacts.iter().map(|a| a.id.clone()));
        }
        for (execution, artifacts) in &self.truncated {
            items.deleted_executions.push(execution.id.clone());
            items
                .archived_artifacts
                .extend(artifacts.iter().map(|a| a.id.clone()));
        }
        items
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    rollback_id: &'a str,
    kind: RollbackKind,
    created_at: DateTime<Utc>,
    source_run_id: &'a str,
    source_run_version: i64,
    target_run_id: &'a str,
    target_checkpoint_id: &'a str,
    target_position: i64,
    reason: Option<&'a str>,
    items: &'a [ArchivedItem],
}

/// A copy made into the archive, checked before anything is deleted.
struct Copied {
    original: PathBuf,
    archived: PathBuf,
    bytes: u64,
}

#[derive(Clone)]
pub struct RollbackEngine {
    store: Arc<Store>,
    mirror: Arc<dyn Mirror>,
}

impl RollbackEngine {
    pub fn new(store: Arc<Store>, mirror: Arc<dyn Mirror>) -> Self {
        Self { store, mirror }
    }

    /// Delete every execution of `run_id` after `target_position`.
    ///
    /// A failed execution at `target_position` is deleted as well, so the
    /// position can run again from scratch.
    pub fn rollback_checkpoint(
        &self,
        run_id: &str,
        target_position: i64,
        reason: Option<&str>,
    ) -> Result<RollbackEvent> {
        let plan = self.store.read(|c| {
            let run = store::get_run(c, run_id)?;
            let target = rollback_target(c, &run, target_position)?;
            let retries_target = target.status == ExecutionStatus::Failed;
            Ok(RollbackPlan {
                kind: RollbackKind::CheckpointLevel,
                source: run.clone(),
                truncated: truncated_from(c, &run, target_position, retries_target)?,
                target_run: run,
                target,
                retries_target,
                runs: Vec::new(),
                reason: reason.map(str::to_string),
            })
        })?;
        if plan.is_empty() {
            return Err(GatehouseError::validation(format!(
                "nothing to roll back after position {target_position}"
            )));
        }
        self.execute(plan)
    }

    /// Delete every run above `target_run_id`, and truncate the target run
    /// after `target_position`.
    pub fn rollback_run(
        &self,
        source_run_id: &str,
        target_run_id: &str,
        target_position: i64,
        reason: Option<&str>,
    ) -> Result<RollbackEvent> {
        let plan = self.store.read(|c| {
            let source = store::get_run(c, source_run_id)?;
            let target_run = store::get_run(c, target_run_id)?;
            if source.pipeline_id != target_run.pipeline_id {
                return Err(GatehouseError::invalid_field(
                    "target_run_id",
                    "target run belongs to another pipeline",
                ));
            }
            if target_run.run_version > source.run_version {
                return Err(GatehouseError::invalid_field(
                    "target_run_id",
                    format!(
                        "v{} is newer than the source run v{}",
                        target_run.run_version, source.run_version
                    ),
                ));
            }
            let target = rollback_target(c, &target_run, target_position)?;
            let retries_target = target.status == ExecutionStatus::Failed;

            let mut runs = Vec::new();
            for run in store::list_runs(c, &source.pipeline_id)? {
                if run.run_version > target_run.run_version {
                    let executions = store::list_executions(c, &run.id)?;
                    let artifacts = store::list_run_artifacts(c, &run.id)?;
                    runs.push((run, executions, artifacts));
                }
            }

            Ok(RollbackPlan {
                kind: RollbackKind::RunLevel,
                truncated: truncated_from(c, &target_run, target_position, retries_target)?,
                source,
                target_run,
                target,
                retries_target,
                runs,
                reason: reason.map(str::to_string),
            })
        })?;
        if plan.is_empty() {
            return Err(GatehouseError::validation(
                "nothing to roll back: no later runs or checkpoints",
            ));
        }
        self.execute(plan)
    }

    /// Rollback events, newest first.
    pub fn history(&self, run_id: Option<&str>) -> Result<Vec<RollbackEvent>> {
        self.store.read(|c| store::list_rollback_events(c, run_id))
    }

    /// Executions a run can be rolled back to: completed ones, and a failed
    /// one to run its position again.
    pub fn rollback_points(&self, run_id: &str) -> Result<Vec<CheckpointExecution>> {
        self.store.read(|c| {
            store::get_run(c, run_id)?;
            Ok(store::list_executions(c, run_id)?
                .into_iter()
                .filter(|e| {
                    matches!(
                        e.status,
                        ExecutionStatus::Completed | ExecutionStatus::Failed
                    )
                })
                .collect())
        })
    }

    pub fn archived_items(&self, rollback_id: &str) -> Result<Vec<ArchivedItem>> {
        self.store.read(|c| store::list_archived_items(c, rollback_id))
    }

    fn execute(&self, plan: RollbackPlan) -> Result<RollbackEvent> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let layout = self.mirror.layout();
        let folder = layout.rollback_dir(&id, created_at);

        // Phases 1 and 2.
        let archived = self
            .archive(&id, &folder, created_at, &plan)
            .map_err(|e| {
                if let Err(cleanup) = self.mirror.remove_tree(&folder) {
                    warn!(rollback_id = %id, error = %cleanup, "failed to remove partial archive");
                }
                match e {
                    GatehouseError::ArchivalFailure(message) => {
                        GatehouseError::ArchivalFailure(message)
                    }
                    other => GatehouseError::ArchivalFailure(other.to_string()),
                }
            })?;

        let event = RollbackEvent {
            id: id.clone(),
            kind: plan.kind,
            source_run_id: plan.source.id.clone(),
            source_run_version: plan.source.run_version,
            target_run_id: plan.target_run.id.clone(),
            target_checkpoint_id: plan.target.checkpoint_id.clone(),
            target_position: plan.target.checkpoint_position,
            archive_location: layout.relative(&folder),
            triggered_by: RollbackTrigger::UserRequest,
            reason: plan.reason.clone(),
            items: plan.items(),
            created_at,
        };

        let mut target_run = plan.target_run.clone();
        let current = if plan.retries_target {
            plan.target.checkpoint_position - 1
        } else {
            plan.target.checkpoint_position
        };
        target_run.current_position = (current >= 0).then_some(current);
        target_run.current_checkpoint_id = target_run
            .current_position
            .and_then(|p| target_run.checkpoint_at(p))
            .map(str::to_string);
        if !plan.truncated.is_empty()
            && matches!(target_run.status, RunStatus::Completed | RunStatus::Failed)
        {
            target_run.status = RunStatus::InProgress;
            target_run.completed_at = None;
            target_run.failed_at = None;
        }

        // Phase 3.
        self.store.write(|tx| {
            store::insert_rollback_event(tx, &event)?;
            for item in &archived {
                store::insert_archived_item(tx, item)?;
            }
            for (run, _, _) in &plan.runs {
                store::delete_run(tx, &run.id)?;
            }
            for (execution, _) in &plan.truncated {
                store::delete_execution(tx, &execution.id)?;
            }
            store::update_run(tx, &target_run)?;
            store::insert_event(
                tx,
                Some(&target_run.id),
                "rollback",
                &format!(
                    "{} rollback to v{} position {}",
                    plan.kind,
                    target_run.run_version,
                    plan.target.checkpoint_position
                ),
            )
        })?;

        // Phase 4.
        for (run, executions, _) in &plan.runs {
            self.remove(&layout.run_dir(run.run_version));
            for execution in executions {
                self.remove(&layout.exec_dir(&execution.id));
            }
        }
        for (execution, _) in &plan.truncated {
            self.remove(&layout.checkpoint_dir(
                target_run.run_version,
                execution.checkpoint_position,
                &execution.checkpoint_name,
            ));
            self.remove(&layout.exec_dir(&execution.id));
        }

        let latest = self
            .store
            .read(|c| store::latest_valid_run(c, &target_run.pipeline_id))?
            .map(|r| r.run_version);
        if let Err(e) = self.mirror.point_latest(latest) {
            warn!(error = %e, "failed to repoint runs/latest");
        }
        let info_path = layout.run_info_path(target_run.run_version);
        if let Err(e) = mirror::write_json(
            self.mirror.as_ref(),
            &info_path,
            &crate::run::RunInfo::from(&target_run),
        ) {
            warn!(error = %e, "failed to refresh run_info.json");
        }

        info!(
            rollback_id = %event.id,
            kind = %event.kind,
            runs = event.items.deleted_runs.len(),
            executions = event.items.deleted_executions.len(),
            archive = %event.archive_location.display(),
            "rollback completed"
        );
        Ok(event)
    }

    /// Copy files and row snapshots into the archive folder and verify them.
    fn archive(
        &self,
        rollback_id: &str,
        folder: &Path,
        created_at: DateTime<Utc>,
        plan: &RollbackPlan,
    ) -> Result<Vec<ArchivedItem>> {
        let layout = self.mirror.layout();
        let data = folder.join(ARCHIVED_DATA_DIR);
        let records = data.join(RECORDS_DIR);
        self.mirror.create_dir(&data)?;

        let mut copies: Vec<Copied> = Vec::new();
        let mut items: Vec<ArchivedItem> = Vec::new();
        let mut item = |item_type: ArchivedItemType,
                        item_id: &str,
                        original: &Path,
                        archived: &Path,
                        size: i64| {
            items.push(ArchivedItem {
                rollback_id: rollback_id.to_string(),
                item_type,
                item_id: item_id.to_string(),
                original_path: layout.relative(original),
                archived_path: layout.relative(archived),
                size_bytes: size,
            });
        };

        for (run, executions, artifacts) in &plan.runs {
            let run_dir = layout.run_dir(run.run_version);
            let archived_run = data.join(run_dir_name(run.run_version));
            let bytes = self.copy(&run_dir, &archived_run, &mut copies)?;
            self.write_record(&records.join("runs"), &run.id, run)?;
            item(ArchivedItemType::Run, &run.id, &run_dir, &archived_run, bytes as i64);

            for execution in executions {
                self.archive_execution(run, execution, &data, &records, &mut copies)?;
                let checkpoint_dir = layout.checkpoint_dir(
                    run.run_version,
                    execution.checkpoint_position,
                    &execution.checkpoint_name,
                );
                let size = artifact_bytes(artifacts, &execution.id);
                item(
                    ArchivedItemType::CheckpointExecution,
                    &execution.id,
                    &checkpoint_dir,
                    &archived_under(&data, layout.relative(&checkpoint_dir)),
                    size,
                );
            }
            for artifact in artifacts {
                self.archive_artifact(artifact, &data, &records, &mut item)?;
            }
        }

        for (execution, artifacts) in &plan.truncated {
            let run = &plan.target_run;
            let checkpoint_dir = layout.checkpoint_dir(
                run.run_version,
                execution.checkpoint_position,
                &execution.checkpoint_name,
            );
            let archived_dir = archived_under(&data, layout.relative(&checkpoint_dir));
            self.copy(&checkpoint_dir, &archived_dir, &mut copies)?;
            self.archive_execution(run, execution, &data, &records, &mut copies)?;
            item(
                ArchivedItemType::CheckpointExecution,
                &execution.id,
                &checkpoint_dir,
                &archived_dir,
                artifact_bytes(artifacts, &execution.id),
            );
            for artifact in artifacts {
                self.archive_artifact(artifact, &data, &records, &mut item)?;
            }
        }

        for copy in &copies {
            self.verify(copy)?;
        }

        let manifest = Manifest {
            rollback_id,
            kind: plan.kind,
            created_at,
            source_run_id: &plan.source.id,
            source_run_version: plan.source.run_version,
            target_run_id: &plan.target_run.id,
            target_checkpoint_id: &plan.target.checkpoint_id,
            target_position: plan.target.checkpoint_position,
            reason: plan.reason.as_deref(),
            items: &items,
        };
        let manifest_path = folder.join(MANIFEST_FILE);
        mirror::write_json(self.mirror.as_ref(), &manifest_path, &manifest)?;
        if !self.mirror.exists(&manifest_path) {
            return Err(GatehouseError::ArchivalFailure(
                "manifest was not written".into(),
            ));
        }
        Ok(items)
    }

    /// Snapshot an execution row and copy its temp workspace, if any.
    fn archive_execution(
        &self,
        run: &PipelineRun,
        execution: &CheckpointExecution,
        data: &Path,
        records: &Path,
        copies: &mut Vec<Copied>,
    ) -> Result<()> {
        let snapshot = self
            .store
            .read(|c| store::execution_snapshot(c, &execution.id))?;
        self.write_record(
            &records.join("executions"),
            &execution.id,
            &serde_json::json!({
                "run_version": run.run_version,
                "execution": execution,
                "checkpoint": snapshot,
            }),
        )?;
        let workspace = self.mirror.layout().exec_dir(&execution.id);
        if self.mirror.exists(&workspace) {
            let archived = data
                .join(TEMP_ARCHIVE_DIR)
                .join(format!("exec_{}", execution.id));
            self.copy(&workspace, &archived, copies)?;
        }
        Ok(())
    }

    fn archive_artifact(
        &self,
        artifact: &Artifact,
        data: &Path,
        records: &Path,
        item: &mut impl FnMut(ArchivedItemType, &str, &Path, &Path, i64),
    ) -> Result<()> {
        let layout = self.mirror.layout();
        self.write_record(
            &records.join("artifacts"),
            &format!("{}_{}", artifact.execution_id, artifact.id),
            artifact,
        )?;
        let original = artifact
            .promoted_path
            .as_deref()
            .unwrap_or(&artifact.staged_path);
        let archived = if artifact.promoted_path.is_some() {
            archived_under(data, original.to_path_buf())
        } else {
            data.join(TEMP_ARCHIVE_DIR).join(
                original
                    .strip_prefix(".temp")
                    .unwrap_or(original),
            )
        };
        item(
            ArchivedItemType::Artifact,
            &artifact.id,
            &layout.resolve(original),
            &archived,
            artifact.size_bytes,
        );
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path, copies: &mut Vec<Copied>) -> Result<u64> {
        if !self.mirror.exists(from) {
            warn!(path = %from.display(), "nothing to archive at path");
            return Ok(0);
        }
        let bytes = self.mirror.copy_tree(from, to)?;
        copies.push(Copied {
            original: from.to_path_buf(),
            archived: to.to_path_buf(),
            bytes,
        });
        Ok(bytes)
    }

    fn verify(&self, copy: &Copied) -> Result<()> {
        let expected = self.mirror.tree_size(&copy.original);
        if !self.mirror.exists(&copy.archived) || self.mirror.tree_size(&copy.archived) != expected
        {
            return Err(GatehouseError::ArchivalFailure(format!(
                "archived copy of {} is incomplete ({} of {} bytes)",
                copy.original.display(),
                copy.bytes,
                expected
            )));
        }
        Ok(())
    }

    fn write_record<T: Serialize + ?Sized>(&self, dir: &Path, id: &str, value: &T) -> Result<()> {
        let path = dir.join(format!("{id}.json"));
        mirror::write_json(self.mirror.as_ref(), &path, value)?;
        self.mirror.file_size(&path)?;
        Ok(())
    }

    fn remove(&self, path: &Path) {
        if let Err(e) = self.mirror.remove_tree(path) {
            warn!(path = %path.display(), error = %e, "failed to remove rolled back files");
        }
    }
}

/// Mirror a root-relative `runs/...` path under `archived_data/`.
fn archived_under(data: &Path, relative: PathBuf) -> PathBuf {
    let trimmed = relative
        .strip_prefix("runs")
        .map(Path::to_path_buf)
        .unwrap_or(relative);
    data.join(trimmed)
}

fn artifact_bytes(artifacts: &[Artifact], execution_id: &str) -> i64 {
    artifacts
        .iter()
        .filter(|a| a.execution_id == execution_id)
        .map(|a| a.size_bytes)
        .sum()
}

/// The execution at `position`; it must be completed or failed.
fn rollback_target(
    conn: &rusqlite::Connection,
    run: &PipelineRun,
    position: i64,
) -> Result<CheckpointExecution> {
    match store::find_execution_at(conn, &run.id, position)? {
        Some(e) if matches!(e.status, ExecutionStatus::Completed | ExecutionStatus::Failed) => {
            Ok(e)
        }
        Some(e) => Err(GatehouseError::conflict(format!(
            "execution at position {position} of v{} is {}, not completed or failed",
            run.run_version, e.status
        ))),
        None => Err(GatehouseError::conflict(format!(
            "v{} has no execution at position {position}",
            run.run_version
        ))),
    }
}

/// Executions after `position`, or from it on with `inclusive`.
fn truncated_from(
    conn: &rusqlite::Connection,
    run: &PipelineRun,
    position: i64,
    inclusive: bool,
) -> Result<Vec<(CheckpointExecution, Vec<Artifact>)>> {
    let first = if inclusive { position } else { position + 1 };
    let mut truncated = Vec::new();
    for execution in store::list_executions(conn, &run.id)? {
        if execution.checkpoint_position >= first {
            let artifacts = store::list_artifacts(conn, &execution.id)?;
            truncated.push((execution, artifacts));
        }
    }
    Ok(truncated)
}
