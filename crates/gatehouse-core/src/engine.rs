//! Command surface over one pipeline root.
//!
//! Every mutating command holds the per-run lock of the run it touches, so a
//! pause, an approval and the advance it triggers never interleave on one
//! run. The lock is released while an executor runs; the reply is applied
//! after re-taking it. Commands that create or delete runs also hold the
//! pipeline lock, and a rollback locks every run it may delete.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::capability::ExecutionCapability;
use crate::config::EngineConfig;
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::definitions::{DefinitionSource, FailureAction};
use crate::execution::{ExecutionMachine, Step};
use crate::layout::Layout;
use crate::locks::{InFlight, RunGuard, RunLocks};
use crate::mirror::{LocalMirror, Mirror};
use crate::resolver::VersionResolver;
use crate::rollback::RollbackEngine;
use crate::run::RunManager;
use crate::store::{self, Store};
use crate::types::{
    ArchivedItem, Artifact, CheckpointExecution, Event, ExecutionLog, Interaction, PipelineRun,
    ProducedArtifact, RollbackEvent, RunSummary,
};
use crate::{GatehouseError, Result};

pub struct Orchestrator {
    pipeline_id: String,
    store: Arc<Store>,
    mirror: Arc<dyn Mirror>,
    artifacts: ArtifactStore,
    resolver: VersionResolver,
    machine: ExecutionMachine,
    runs: RunManager,
    rollback: RollbackEngine,
    checker: ConsistencyChecker,
    locks: RunLocks,
    in_flight: InFlight,
}

impl Orchestrator {
    /// Open the pipeline root at `root`, creating its skeleton and database.
    pub fn open(
        root: &Path,
        pipeline_id: &str,
        definitions: Arc<dyn DefinitionSource>,
        capability: Arc<dyn ExecutionCapability>,
        config: EngineConfig,
    ) -> Result<Self> {
        let layout = Layout::new(root);
        let mirror: Arc<dyn Mirror> = Arc::new(LocalMirror::new(layout.clone()));
        mirror.initialize()?;
        let store = Arc::new(Store::open(&layout.db_path())?);

        let orchestrator = Self::from_parts(
            pipeline_id,
            store,
            mirror,
            definitions,
            capability,
            &config,
        );
        if config.check_on_startup {
            let report = orchestrator.check_consistency(true)?;
            if !report.is_consistent() {
                warn!(drifts = report.drifts.len(), "repaired mirror on startup");
            }
        }
        info!(pipeline_id, root = %root.display(), "orchestrator opened");
        Ok(orchestrator)
    }

    /// Assemble from explicit ports.
    pub fn from_parts(
        pipeline_id: &str,
        store: Arc<Store>,
        mirror: Arc<dyn Mirror>,
        definitions: Arc<dyn DefinitionSource>,
        capability: Arc<dyn ExecutionCapability>,
        config: &EngineConfig,
    ) -> Self {
        let artifacts =
            ArtifactStore::new(store.clone(), mirror.clone(), config.max_artifact_bytes);
        let resolver = VersionResolver::new(store.clone());
        let machine = ExecutionMachine::new(
            store.clone(),
            mirror.clone(),
            artifacts.clone(),
            resolver.clone(),
            definitions.clone(),
            capability,
            config,
        );
        let runs = RunManager::new(
            store.clone(),
            mirror.clone(),
            artifacts.clone(),
            definitions,
            machine.clone(),
        );
        Self {
            pipeline_id: pipeline_id.to_string(),
            rollback: RollbackEngine::new(store.clone(), mirror.clone()),
            checker: ConsistencyChecker::new(store.clone(), mirror.clone()),
            store,
            mirror,
            artifacts,
            resolver,
            machine,
            runs,
            locks: RunLocks::default(),
            in_flight: InFlight::default(),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn layout(&self) -> &Layout {
        self.mirror.layout()
    }

    async fn lock_run(&self, run_id: &str) -> RunGuard {
        self.locks.acquire(run_id).await
    }

    async fn lock_pipeline(&self) -> RunGuard {
        self.locks
            .acquire(&format!("pipeline:{}", self.pipeline_id))
            .await
    }

    /// Refuse while an executor call for one of `run_ids` is outstanding.
    fn ensure_idle<'a>(&self, run_ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        match self.in_flight.running_in(run_ids) {
            Some(execution_id) => Err(GatehouseError::conflict(format!(
                "execution {execution_id} has an executor call in flight"
            ))),
            None => Ok(()),
        }
    }

    /// Lock the run owning `execution_id`.
    async fn lock_execution_run(&self, execution_id: &str) -> Result<(String, RunGuard)> {
        let run_id = self.machine.get(execution_id)?.run_id;
        let guard = self.lock_run(&run_id).await;
        Ok((run_id, guard))
    }

    // ── Runs ────────────────────────────────────────────────────────

    pub async fn create_run(&self, extends_from_run_id: Option<&str>) -> Result<PipelineRun> {
        let _pipeline = self.lock_pipeline().await;
        self.runs.create_run(&self.pipeline_id, extends_from_run_id)
    }

    pub async fn start_run(&self, run_id: &str) -> Result<RunSummary> {
        let guard = self.lock_run(run_id).await;
        let execution = self.runs.start_run(run_id)?;
        let step = self.machine.activate(&execution.id);
        self.drive(run_id, guard, step).await?;
        self.runs.summary(run_id)
    }

    /// Stop the run from advancing. An executor call in flight finishes, and
    /// its execution completes, but no next execution is created.
    pub async fn pause_run(&self, run_id: &str) -> Result<PipelineRun> {
        let _guard = self.lock_run(run_id).await;
        self.runs.pause_run(run_id)
    }

    pub async fn resume_run(&self, run_id: &str) -> Result<RunSummary> {
        let guard = self.lock_run(run_id).await;
        if let Some(next) = self.runs.resume_run(run_id)? {
            let step = self.machine.activate(&next.id);
            self.drive(run_id, guard, step).await?;
        }
        self.runs.summary(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunSummary> {
        self.runs.summary(run_id)
    }

    /// Resolve a run by id, `v{N}` or version number.
    pub fn find_run(&self, reference: &str) -> Result<PipelineRun> {
        self.runs.find(&self.pipeline_id, reference)
    }

    pub fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        self.runs.list_runs(&self.pipeline_id)
    }

    pub fn latest_valid_run(&self) -> Result<Option<PipelineRun>> {
        self.resolver.latest_valid_run(&self.pipeline_id)
    }

    // ── Executions ──────────────────────────────────────────────────

    pub async fn approve_start(&self, execution_id: &str) -> Result<CheckpointExecution> {
        let (run_id, guard) = self.lock_execution_run(execution_id).await?;
        let step = self.machine.approve_start(execution_id);
        self.drive(&run_id, guard, step).await?;
        self.machine.get(execution_id)
    }

    pub async fn submit_form_data(
        &self,
        execution_id: &str,
        data: Value,
    ) -> Result<CheckpointExecution> {
        let (run_id, guard) = self.lock_execution_run(execution_id).await?;
        let step = self.machine.submit_form_data(execution_id, data);
        self.drive(&run_id, guard, step).await?;
        self.machine.get(execution_id)
    }

    pub async fn approve_complete(&self, execution_id: &str) -> Result<CheckpointExecution> {
        let (run_id, guard) = self.lock_execution_run(execution_id).await?;
        let step = self.machine.approve_complete(execution_id);
        self.drive(&run_id, guard, step).await?;
        self.machine.get(execution_id)
    }

    pub async fn request_revision(
        &self,
        execution_id: &str,
        feedback: &str,
    ) -> Result<CheckpointExecution> {
        let (run_id, guard) = self.lock_execution_run(execution_id).await?;
        let step = self.machine.request_revision(execution_id, feedback);
        self.drive(&run_id, guard, step).await?;
        self.machine.get(execution_id)
    }

    /// Completion callback for a deferred executor.
    pub async fn report_success(
        &self,
        execution_id: &str,
        produced: Vec<ProducedArtifact>,
    ) -> Result<CheckpointExecution> {
        let (run_id, guard) = self.lock_execution_run(execution_id).await?;
        self.ensure_not_running(execution_id)?;
        let step = self.machine.report_success(execution_id, &produced);
        self.drive(&run_id, guard, step).await?;
        self.machine.get(execution_id)
    }

    /// Failure callback for a deferred executor.
    pub async fn report_failure(
        &self,
        execution_id: &str,
        message: &str,
    ) -> Result<CheckpointExecution> {
        let (run_id, guard) = self.lock_execution_run(execution_id).await?;
        self.ensure_not_running(execution_id)?;
        let step = self.machine.report_failure(execution_id, message);
        self.drive(&run_id, guard, step).await?;
        self.machine.get(execution_id)
    }

    /// Executor reports are only accepted for deferred work.
    fn ensure_not_running(&self, execution_id: &str) -> Result<()> {
        if self.in_flight.has_execution(execution_id) {
            return Err(GatehouseError::conflict(format!(
                "execution {execution_id} is still running inline"
            )));
        }
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<CheckpointExecution> {
        self.machine.get(execution_id)
    }

    pub fn list_executions(&self, run_id: &str) -> Result<Vec<CheckpointExecution>> {
        self.store.read(|c| {
            store::get_run(c, run_id)?;
            store::list_executions(c, run_id)
        })
    }

    pub fn list_artifacts(&self, execution_id: &str) -> Result<Vec<Artifact>> {
        self.machine.get(execution_id)?;
        self.artifacts.list(execution_id)
    }

    pub fn execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        self.store.read(|c| store::list_logs(c, execution_id))
    }

    pub fn interactions(&self, execution_id: &str) -> Result<Vec<Interaction>> {
        self.store.read(|c| store::list_interactions(c, execution_id))
    }

    pub fn events(&self, run_id: Option<&str>) -> Result<Vec<Event>> {
        self.store.read(|c| store::list_events(c, run_id))
    }

    // ── Rollback ────────────────────────────────────────────────────

    pub async fn rollback_checkpoint(
        &self,
        run_id: &str,
        target_position: i64,
        reason: Option<&str>,
    ) -> Result<RollbackEvent> {
        let guard = self.lock_run(run_id).await;
        self.ensure_idle([run_id])?;
        let event = self
            .rollback
            .rollback_checkpoint(run_id, target_position, reason)?;
        self.continue_after_rollback(run_id, guard).await?;
        Ok(event)
    }

    pub async fn rollback_run(
        &self,
        source_run_id: &str,
        target_run_id: &str,
        target_position: i64,
        reason: Option<&str>,
    ) -> Result<RollbackEvent> {
        let _pipeline = self.lock_pipeline().await;
        let target = self.runs.get(target_run_id)?;
        let mut later: Vec<PipelineRun> = self
            .list_runs()?
            .into_iter()
            .filter(|run| run.run_version > target.run_version)
            .collect();
        later.sort_by_key(|run| run.run_version);

        // Ascending version order, the target first.
        let guard = self.lock_run(target_run_id).await;
        let mut later_guards = Vec::with_capacity(later.len());
        for run in &later {
            later_guards.push(self.lock_run(&run.id).await);
        }
        let affected = std::iter::once(target_run_id).chain(later.iter().map(|r| r.id.as_str()));
        self.ensure_idle(affected)?;

        let event =
            self.rollback
                .rollback_run(source_run_id, target_run_id, target_position, reason)?;
        drop(later_guards);
        self.continue_after_rollback(target_run_id, guard).await?;
        Ok(event)
    }

    /// Create the execution after the rollback target when the run is live.
    async fn continue_after_rollback(&self, run_id: &str, guard: RunGuard) -> Result<()> {
        if let Some(next) = self.runs.advance(run_id)? {
            let step = self.machine.activate(&next.id);
            self.drive(run_id, guard, step).await?;
        }
        Ok(())
    }

    pub fn rollback_history(&self, run_id: Option<&str>) -> Result<Vec<RollbackEvent>> {
        self.rollback.history(run_id)
    }

    pub fn rollback_points(&self, run_id: &str) -> Result<Vec<CheckpointExecution>> {
        self.rollback.rollback_points(run_id)
    }

    pub fn archived_items(&self, rollback_id: &str) -> Result<Vec<ArchivedItem>> {
        self.rollback.archived_items(rollback_id)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    pub fn check_consistency(&self, repair: bool) -> Result<ConsistencyReport> {
        self.checker.check(&self.pipeline_id, repair)
    }

    pub fn prune_errored(&self, retention_days: u32) -> Result<usize> {
        self.checker.prune_errored(retention_days)
    }

    /// Follow a transition through any advances it unlocks.
    ///
    /// Completed executions advance the run and activate the next one until
    /// something waits, fails, or the run ends. `_guard` is the run's lock;
    /// it is given up for the length of each executor call.
    async fn drive(&self, run_id: &str, mut _guard: RunGuard, step: Result<Step>) -> Result<()> {
        let mut step = self.stop_on_unmet(run_id, step)?;
        loop {
            match step {
                Step::Waiting => return Ok(()),
                Step::Failed(action) => {
                    self.runs.on_execution_failed(run_id, action)?;
                    return Ok(());
                }
                Step::Completed => {
                    let Some(next) = self.runs.advance(run_id)? else {
                        return Ok(());
                    };
                    let activated = self.machine.activate(&next.id);
                    step = self.stop_on_unmet(run_id, activated)?;
                }
                Step::Invoke(attempt) => {
                    let call = self.in_flight.enter(attempt.execution_id(), attempt.run_id());
                    drop(_guard);
                    let reply = self.machine.call(&attempt).await;
                    _guard = self.lock_run(run_id).await;
                    drop(call);
                    let settled = self.machine.settle(&attempt, reply);
                    step = self.stop_on_unmet(run_id, settled)?;
                }
            }
        }
    }

    /// An unmet dependency already failed its execution; fail the run too.
    fn stop_on_unmet(&self, run_id: &str, step: Result<Step>) -> Result<Step> {
        match step {
            Err(e @ GatehouseError::UnmetDependency { .. }) => {
                self.runs
                    .on_execution_failed(run_id, FailureAction::RollbackCheckpoint)?;
                Err(e)
            }
            other => other,
        }
    }
}
