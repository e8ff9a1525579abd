//! Reconciles the file mirror with the store of record.
//!
//! The store always wins. Repair rebuilds `runs/` wholesale and rewrites the
//! staged files of live executions; it never patches individual files and
//! never touches `.archived/`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::artifacts::sha256_hex;
use crate::layout::{FOLDER_TIMESTAMP, parse_run_dir_name};
use crate::mirror::{self, Mirror};
use crate::run::RunInfo;
use crate::store::{self, Store};
use crate::types::{Artifact, CheckpointExecution, ExecutionStatus, PipelineRun};
use crate::Result;

/// One divergence between the mirror and the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    MissingRunDir { run_version: i64 },
    StaleRunInfo { run_version: i64 },
    WrongLatest {
        expected: Option<i64>,
        found: Option<i64>,
    },
    MissingPromotedFile { artifact_id: String, path: PathBuf },
    CorruptedPromotedFile { artifact_id: String, path: PathBuf },
    MissingStagedFile { artifact_id: String, path: PathBuf },
    OrphanRunDir { path: PathBuf },
    OrphanTempWorkspace { path: PathBuf },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub drifts: Vec<Drift>,
    pub repaired: bool,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.drifts.is_empty()
    }
}

/// Everything the store says one pipeline's mirror should contain.
struct Expected {
    runs: Vec<(PipelineRun, Vec<CheckpointExecution>, Vec<Artifact>)>,
    latest: Option<i64>,
}

impl Expected {
    fn execution_ids(&self) -> HashSet<&str> {
        self.runs
            .iter()
            .flat_map(|(_, executions, _)| executions.iter().map(|e| e.id.as_str()))
            .collect()
    }
}

#[derive(Clone)]
pub struct ConsistencyChecker {
    store: Arc<Store>,
    mirror: Arc<dyn Mirror>,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<Store>, mirror: Arc<dyn Mirror>) -> Self {
        Self { store, mirror }
    }

    /// Compare mirror and store; with `repair`, regenerate the mirror when
    /// anything diverged.
    pub fn check(&self, pipeline_id: &str, repair: bool) -> Result<ConsistencyReport> {
        let expected = self.expected(pipeline_id)?;
        let drifts = self.detect(&expected)?;
        for drift in &drifts {
            warn!(?drift, "mirror drift detected");
        }

        let repaired = repair && !drifts.is_empty();
        if repaired {
            self.rebuild(&expected)?;
            self.store.write(|tx| {
                store::insert_event(
                    tx,
                    None,
                    "mirror_repaired",
                    &format!("regenerated mirror after {} drift(s)", drifts.len()),
                )
            })?;
            info!(pipeline_id, drifts = drifts.len(), "mirror regenerated from store");
        }
        Ok(ConsistencyReport { drifts, repaired })
    }

    fn expected(&self, pipeline_id: &str) -> Result<Expected> {
        self.store.read(|c| {
            let mut runs = Vec::new();
            for run in store::list_runs(c, pipeline_id)? {
                let executions = store::list_executions(c, &run.id)?;
                let artifacts = store::list_run_artifacts(c, &run.id)?;
                runs.push((run, executions, artifacts));
            }
            let latest = store::latest_valid_run(c, pipeline_id)?.map(|r| r.run_version);
            Ok(Expected { runs, latest })
        })
    }

    fn detect(&self, expected: &Expected) -> Result<Vec<Drift>> {
        let layout = self.mirror.layout();
        let mut drifts = Vec::new();

        for (run, executions, artifacts) in &expected.runs {
            if !self.mirror.exists(&layout.run_dir(run.run_version)) {
                drifts.push(Drift::MissingRunDir {
                    run_version: run.run_version,
                });
            } else if !self.run_info_matches(run) {
                drifts.push(Drift::StaleRunInfo {
                    run_version: run.run_version,
                });
            }

            for artifact in artifacts {
                match &artifact.promoted_path {
                    Some(path) => {
                        let abs = layout.resolve(path);
                        match self.mirror.read_file(&abs) {
                            Err(_) => drifts.push(Drift::MissingPromotedFile {
                                artifact_id: artifact.id.clone(),
                                path: path.clone(),
                            }),
                            Ok(bytes) if sha256_hex(&bytes) != artifact.checksum => {
                                drifts.push(Drift::CorruptedPromotedFile {
                                    artifact_id: artifact.id.clone(),
                                    path: path.clone(),
                                })
                            }
                            Ok(_) => {}
                        }
                    }
                    None if is_live(executions, &artifact.execution_id) => {
                        if !self.mirror.exists(&layout.resolve(&artifact.staged_path)) {
                            drifts.push(Drift::MissingStagedFile {
                                artifact_id: artifact.id.clone(),
                                path: artifact.staged_path.clone(),
                            });
                        }
                    }
                    None => {}
                }
            }
        }

        let found = self.mirror.read_latest();
        if found != expected.latest {
            drifts.push(Drift::WrongLatest {
                expected: expected.latest,
                found,
            });
        }

        let versions: HashSet<i64> = expected.runs.iter().map(|(r, _, _)| r.run_version).collect();
        for path in self.mirror.list_dir(&layout.runs_dir())? {
            let version = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_run_dir_name);
            if let Some(v) = version
                && !versions.contains(&v)
            {
                drifts.push(Drift::OrphanRunDir {
                    path: layout.relative(&path),
                });
            }
        }

        let execution_ids = expected.execution_ids();
        for path in self.mirror.list_dir(&layout.temp_dir())? {
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("exec_"));
            if id.is_none_or(|id| !execution_ids.contains(id)) {
                drifts.push(Drift::OrphanTempWorkspace {
                    path: layout.relative(&path),
                });
            }
        }

        Ok(drifts)
    }

    fn run_info_matches(&self, run: &PipelineRun) -> bool {
        let path = self.mirror.layout().run_info_path(run.run_version);
        self.mirror
            .read_file(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<RunInfo>(&bytes).ok())
            .is_some_and(|info| info == RunInfo::from(run))
    }

    /// Regenerate `runs/`, live staging files and `runs/latest`; drop orphan
    /// temp workspaces.
    fn rebuild(&self, expected: &Expected) -> Result<()> {
        let layout = self.mirror.layout();
        self.mirror.remove_tree(&layout.runs_dir())?;
        self.mirror.create_dir(&layout.runs_dir())?;

        for (run, executions, artifacts) in &expected.runs {
            self.mirror.create_dir(&layout.run_dir(run.run_version))?;
            mirror::write_json(
                self.mirror.as_ref(),
                &layout.run_info_path(run.run_version),
                &RunInfo::from(run),
            )?;

            for execution in executions {
                if execution.status == ExecutionStatus::Completed {
                    self.mirror
                        .create_dir(&layout.resolve(&execution.permanent_output_path))?;
                }
            }

            for artifact in artifacts {
                let target = match &artifact.promoted_path {
                    Some(path) => path,
                    None if is_live(executions, &artifact.execution_id) => &artifact.staged_path,
                    None => continue,
                };
                let content = self.store.read(|c| {
                    store::artifact_content(c, &artifact.execution_id, &artifact.id)
                })?;
                self.mirror.write_file(&layout.resolve(target), &content)?;
            }

            for execution in executions.iter().filter(|e| is_live_status(e.status)) {
                self.mirror.create_dir(&layout.workspace_dir(&execution.id))?;
                self.mirror.create_dir(&layout.staging_dir(&execution.id))?;
            }
        }

        let execution_ids = expected.execution_ids();
        for path in self.mirror.list_dir(&layout.temp_dir())? {
            let known = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("exec_"))
                .is_some_and(|id| execution_ids.contains(id));
            if !known {
                self.mirror.remove_tree(&path)?;
            }
        }

        self.mirror.point_latest(expected.latest)?;
        Ok(())
    }

    /// Remove `.errored/` entries older than `retention_days`.
    pub fn prune_errored(&self, retention_days: u32) -> Result<usize> {
        let layout = self.mirror.layout();
        let cutoff = Utc::now().naive_utc() - Duration::days(i64::from(retention_days));
        let mut removed = 0;
        for path in self.mirror.list_dir(&layout.errored_dir())? {
            let Some(stamp) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(errored_timestamp)
            else {
                continue;
            };
            if stamp < cutoff {
                self.mirror.remove_tree(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, retention_days, "pruned errored workspaces");
        }
        Ok(removed)
    }
}

fn is_live_status(status: ExecutionStatus) -> bool {
    matches!(
        status,
        ExecutionStatus::InProgress | ExecutionStatus::WaitingApprovalToComplete
    )
}

fn is_live(executions: &[CheckpointExecution], execution_id: &str) -> bool {
    executions
        .iter()
        .any(|e| e.id == execution_id && is_live_status(e.status))
}

/// Timestamp suffix of `exec_{id}_{YYYYmmdd_HHMMSS}`.
fn errored_timestamp(name: &str) -> Option<NaiveDateTime> {
    let split = name.len().checked_sub(15)?;
    let suffix = name.get(split..)?;
    NaiveDateTime::parse_from_str(suffix, FOLDER_TIMESTAMP).ok()
}
