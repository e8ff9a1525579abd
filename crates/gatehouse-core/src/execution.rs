//! Checkpoint execution state machine.
//!
//! ```text
//! pending ──► waiting_approval_to_start ──► in_progress ──► waiting_approval_to_complete
//!    │                                         │  ▲                    │      │
//!    └────────────────────────────────────────►│  └── revision ────────┘      ▼
//!                                              │                          completed
//!                                              └──► failed (retries or revisions exhausted)
//! ```
//!
//! One row per execution. Retries bump `attempt_number` and revisions bump
//! `revision_iteration`; the id and temp workspace never change.
//!
//! Executor calls are split out as [`Step::Invoke`]: the caller runs
//! [`ExecutionMachine::call`] without holding the run's lock and hands the
//! reply to [`ExecutionMachine::settle`] once it holds the lock again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::capability::{ExecutionCapability, ExecutionReply, ExecutionRequest};
use crate::config::EngineConfig;
use crate::definitions::{
    CheckpointDefinition, DefinitionSource, ExecutionMode, FailureAction, FieldType,
    HumanOnlyConfig,
};
use crate::mirror::Mirror;
use crate::resolver::VersionResolver;
use crate::store::{self, Store};
use crate::types::{
    ArtifactFormat, CheckpointExecution, ExecutionStatus, InputContext, InteractionKind, LogLevel,
    PipelineRun, ProducedArtifact,
};
use crate::{GatehouseError, Result};

/// Where an execution stopped after a transition.
#[derive(Debug, Clone)]
pub enum Step {
    /// Waiting on a human or on a deferred executor.
    Waiting,
    /// Promoted and completed; the run may advance.
    Completed,
    /// Terminally failed; the run applies the failure action.
    Failed(FailureAction),
    /// The executor has to be called for this attempt.
    Invoke(Attempt),
}

/// One executor call, prepared while the run lock was held.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub request: ExecutionRequest,
    timeout_minutes: Option<u64>,
    /// Pause before calling; non-zero for retries.
    delay: Duration,
}

impl Attempt {
    pub fn execution_id(&self) -> &str {
        &self.request.execution_id
    }

    pub fn run_id(&self) -> &str {
        &self.request.run_id
    }

    /// Whether `execution` is still the attempt this call was made for.
    fn is_current(&self, execution: &CheckpointExecution) -> bool {
        execution.status == ExecutionStatus::InProgress
            && execution.attempt_number == self.request.attempt_number
            && execution.revision_iteration == self.request.revision_iteration
    }
}

/// Result of one failed attempt.
enum AttemptOutcome {
    Retry,
    Exhausted,
}

/// Drives single executions through their states.
#[derive(Clone)]
pub struct ExecutionMachine {
    store: Arc<Store>,
    mirror: Arc<dyn Mirror>,
    artifacts: ArtifactStore,
    resolver: VersionResolver,
    definitions: Arc<dyn DefinitionSource>,
    capability: Arc<dyn ExecutionCapability>,
    retry_delay: Duration,
}

impl ExecutionMachine {
    pub fn new(
        store: Arc<Store>,
        mirror: Arc<dyn Mirror>,
        artifacts: ArtifactStore,
        resolver: VersionResolver,
        definitions: Arc<dyn DefinitionSource>,
        capability: Arc<dyn ExecutionCapability>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            mirror,
            artifacts,
            resolver,
            definitions,
            capability,
            retry_delay: config.retry_delay,
        }
    }

    pub fn get(&self, execution_id: &str) -> Result<CheckpointExecution> {
        self.store.read(|c| store::get_execution(c, execution_id))
    }

    /// Create the pending execution for `position` of `run`.
    ///
    /// Captures the checkpoint definition as it is now. With `gate_start`
    /// the execution waits for approval to start even if the checkpoint does
    /// not ask for it. The run row is repointed in the same transaction.
    pub fn create(
        &self,
        run: &mut PipelineRun,
        position: i64,
        gate_start: bool,
    ) -> Result<CheckpointExecution> {
        let checkpoint_id = run.checkpoint_at(position).ok_or_else(|| {
            GatehouseError::InvalidPipelineState(format!(
                "run {} has no checkpoint at position {position}",
                run.id
            ))
        })?;
        let mut snapshot = self.definitions.checkpoint(checkpoint_id)?;
        snapshot.requires_approval_to_start |= gate_start;

        let id = uuid::Uuid::new_v4().to_string();
        let layout = self.mirror.layout();
        let name = snapshot.display_name().to_string();
        let execution = CheckpointExecution {
            temp_workspace_path: layout.relative(&layout.exec_dir(&id)),
            permanent_output_path: layout.relative(&layout.outputs_dir(
                run.run_version,
                position,
                &name,
            )),
            id,
            run_id: run.id.clone(),
            checkpoint_id: snapshot.id.clone(),
            checkpoint_name: name,
            checkpoint_position: position,
            status: ExecutionStatus::Pending,
            attempt_number: 1,
            revision_iteration: 0,
            form_data: None,
            last_error: None,
            failure_action: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        };

        self.artifacts.create_workspace(&execution.id)?;
        run.current_checkpoint_id = Some(execution.checkpoint_id.clone());
        run.current_position = Some(position);
        self.store.write(|tx| {
            store::insert_execution(tx, &execution, &snapshot)?;
            store::update_run(tx, run)
        })?;

        info!(
            run_id = %run.id,
            execution_id = %execution.id,
            checkpoint_id = %execution.checkpoint_id,
            position,
            "created execution"
        );
        Ok(execution)
    }

    /// Move a pending execution to its first waiting state.
    pub fn activate(&self, execution_id: &str) -> Result<Step> {
        let (mut execution, snapshot) = self.load(execution_id)?;
        expect_status(&execution, &[ExecutionStatus::Pending])?;

        if snapshot.requires_approval_to_start {
            execution.status = ExecutionStatus::WaitingApprovalToStart;
            self.store.write(|tx| store::update_execution(tx, &execution))?;
            info!(execution_id, "waiting for approval to start");
            return Ok(Step::Waiting);
        }
        self.begin(execution, snapshot, None)
    }

    pub fn approve_start(&self, execution_id: &str) -> Result<Step> {
        let (execution, snapshot) = self.load(execution_id)?;
        expect_status(&execution, &[ExecutionStatus::WaitingApprovalToStart])?;
        info!(execution_id, "start approved");
        self.begin(execution, snapshot, Some(InteractionKind::ApprovalToStart))
    }

    /// Enter `in_progress` and, for executor modes, prepare the first call.
    ///
    /// An unmet input dependency fails the execution and is returned as an
    /// error.
    fn begin(
        &self,
        mut execution: CheckpointExecution,
        snapshot: CheckpointDefinition,
        interaction: Option<InteractionKind>,
    ) -> Result<Step> {
        let input = match self.resolver.build_input_context(&execution, &snapshot) {
            Ok(input) => input,
            Err(e @ GatehouseError::UnmetDependency { .. }) => {
                self.fail(
                    execution,
                    &snapshot,
                    &e.to_string(),
                    FailureAction::RollbackCheckpoint,
                )?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        execution.status = ExecutionStatus::InProgress;
        execution.started_at = Some(Utc::now());
        self.store.write(|tx| {
            if let Some(kind) = interaction {
                store::insert_interaction(tx, &execution.id, kind, None, None)?;
            }
            store::update_execution(tx, &execution)
        })?;
        info!(execution_id = %execution.id, mode = snapshot.mode.as_str(), "execution in progress");

        if snapshot.mode.is_human() {
            return Ok(Step::Waiting);
        }
        self.prepare(&execution, snapshot, input, Duration::ZERO)
            .map(Step::Invoke)
    }

    fn prepare(
        &self,
        execution: &CheckpointExecution,
        snapshot: CheckpointDefinition,
        input: InputContext,
        delay: Duration,
    ) -> Result<Attempt> {
        let run_version = self
            .store
            .read(|c| store::get_run(c, &execution.run_id))?
            .run_version;
        Ok(Attempt {
            timeout_minutes: snapshot.timeout_minutes,
            request: ExecutionRequest {
                execution_id: execution.id.clone(),
                run_id: execution.run_id.clone(),
                run_version,
                checkpoint: snapshot,
                attempt_number: execution.attempt_number,
                revision_iteration: execution.revision_iteration,
                workspace: self.mirror.layout().workspace_dir(&execution.id),
                input,
            },
            delay,
        })
    }

    /// Prepare the next attempt after a failed one, with the retry delay.
    fn retry(
        &self,
        execution: &CheckpointExecution,
        snapshot: CheckpointDefinition,
    ) -> Result<Step> {
        let input = self.resolver.build_input_context(execution, &snapshot)?;
        self.prepare(execution, snapshot, input, self.retry_delay)
            .map(Step::Invoke)
    }

    /// Run the executor for one attempt. Touches neither store nor mirror.
    pub async fn call(&self, attempt: &Attempt) -> anyhow::Result<ExecutionReply> {
        if !attempt.delay.is_zero() {
            tokio::time::sleep(attempt.delay).await;
        }
        let call = self.capability.execute(attempt.request.clone());
        match attempt.timeout_minutes {
            Some(minutes) => tokio::time::timeout(Duration::from_secs(minutes * 60), call)
                .await
                .map_err(|_| anyhow::anyhow!("timed out after {minutes} minutes"))?,
            None => call.await,
        }
    }

    /// Apply an executor reply to the execution it was made for.
    ///
    /// A reply for an execution that was removed or moved on in the meantime
    /// is dropped.
    pub fn settle(
        &self,
        attempt: &Attempt,
        reply: anyhow::Result<ExecutionReply>,
    ) -> Result<Step> {
        let execution_id = attempt.execution_id();
        let (mut execution, snapshot) = match self.load(execution_id) {
            Ok(loaded) => loaded,
            Err(GatehouseError::NotFound { .. }) => {
                warn!(execution_id, "execution removed while its executor ran");
                return Ok(Step::Waiting);
            }
            Err(e) => return Err(e),
        };
        if !attempt.is_current(&execution) {
            warn!(
                execution_id,
                status = %execution.status,
                attempt = attempt.request.attempt_number,
                "dropping executor reply for a superseded attempt"
            );
            return Ok(Step::Waiting);
        }

        let message = match reply {
            Ok(ExecutionReply::Produced(produced)) => {
                match self.stage_all(&execution, &snapshot, &produced) {
                    Ok(()) => return self.finish_work(execution, &snapshot),
                    Err(e) => format!("staging failed: {e}"),
                }
            }
            Ok(ExecutionReply::Deferred) => {
                debug!(execution_id, "waiting for executor report");
                return Ok(Step::Waiting);
            }
            Err(e) => format!("{e:#}"),
        };

        match self.record_attempt_failure(&mut execution, &snapshot, &message)? {
            AttemptOutcome::Retry => self.retry(&execution, snapshot),
            AttemptOutcome::Exhausted => {
                let action = snapshot.retry.on_failure;
                self.fail(execution, &snapshot, &message, action)
            }
        }
    }

    fn stage_all(
        &self,
        execution: &CheckpointExecution,
        snapshot: &CheckpointDefinition,
        produced: &[ProducedArtifact],
    ) -> Result<()> {
        let mut staged = Vec::with_capacity(produced.len());
        for artifact in produced {
            let id = snapshot.artifact_id_for(&artifact.name);
            self.artifacts.stage_with_id(
                execution,
                &id,
                &artifact.name,
                &artifact.content,
                artifact.format,
            )?;
            staged.push(id);
        }
        self.artifacts.retain_staged(execution, &staged)
    }

    fn record_attempt_failure(
        &self,
        execution: &mut CheckpointExecution,
        snapshot: &CheckpointDefinition,
        message: &str,
    ) -> Result<AttemptOutcome> {
        let attempt = execution.attempt_number;
        warn!(execution_id = %execution.id, attempt, error = message, "attempt failed");

        let retry = attempt <= i64::from(snapshot.retry.max_auto_retries);
        if retry {
            execution.attempt_number += 1;
        }
        execution.last_error = Some(message.to_string());
        self.store.write(|tx| {
            store::insert_log(
                tx,
                &execution.id,
                LogLevel::Error,
                &format!("attempt {attempt} failed: {message}"),
            )?;
            store::update_execution(tx, execution)
        })?;
        Ok(if retry {
            AttemptOutcome::Retry
        } else {
            AttemptOutcome::Exhausted
        })
    }

    /// Stage what a deferred executor produced.
    pub fn report_success(
        &self,
        execution_id: &str,
        produced: &[ProducedArtifact],
    ) -> Result<Step> {
        let (execution, snapshot) = self.load(execution_id)?;
        expect_status(&execution, &[ExecutionStatus::InProgress])?;
        if snapshot.mode.is_human() {
            return Err(GatehouseError::conflict(format!(
                "execution {execution_id} is human_only; submit form data instead"
            )));
        }
        self.stage_all(&execution, &snapshot, produced)?;
        self.store.write(|tx| {
            store::insert_log(
                tx,
                execution_id,
                LogLevel::Info,
                &format!("executor reported {} artifact(s)", produced.len()),
            )
        })?;
        self.finish_work(execution, &snapshot)
    }

    /// Record a deferred executor's failure, retrying within policy.
    pub fn report_failure(&self, execution_id: &str, message: &str) -> Result<Step> {
        let (mut execution, snapshot) = self.load(execution_id)?;
        expect_status(&execution, &[ExecutionStatus::InProgress])?;
        match self.record_attempt_failure(&mut execution, &snapshot, message)? {
            AttemptOutcome::Retry => self.retry(&execution, snapshot),
            AttemptOutcome::Exhausted => {
                let action = snapshot.retry.on_failure;
                self.fail(execution, &snapshot, message, action)
            }
        }
    }

    /// Accept a human_only form.
    ///
    /// Allowed while in progress and while awaiting completion approval; a
    /// resubmission replaces the staged form artifact.
    pub fn submit_form_data(&self, execution_id: &str, data: Value) -> Result<Step> {
        let (mut execution, snapshot) = self.load(execution_id)?;
        expect_status(
            &execution,
            &[
                ExecutionStatus::InProgress,
                ExecutionStatus::WaitingApprovalToComplete,
            ],
        )?;
        let ExecutionMode::HumanOnly(config) = &snapshot.mode else {
            return Err(GatehouseError::conflict(format!(
                "execution {execution_id} is {}, not human_only",
                snapshot.mode.as_str()
            )));
        };
        let Value::Object(fields) = &data else {
            return Err(GatehouseError::validation("form data must be a JSON object"));
        };
        validate_form(config, fields)?;

        if let Some(target) = &config.save_as_artifact {
            let content = render_form(fields, target.format)?;
            self.artifacts.stage_with_id(
                &execution,
                &target.id,
                &target.name,
                &content,
                target.format,
            )?;
        }

        execution.form_data = Some(data.clone());
        self.store.write(|tx| {
            store::insert_interaction(
                tx,
                execution_id,
                InteractionKind::FormSubmission,
                None,
                Some(&data),
            )?;
            store::update_execution(tx, &execution)
        })?;
        info!(execution_id, "form data submitted");

        if execution.status == ExecutionStatus::WaitingApprovalToComplete {
            return Ok(Step::Waiting);
        }
        self.finish_work(execution, &snapshot)
    }

    /// Work is staged: wait for approval, or complete straight away.
    fn finish_work(
        &self,
        mut execution: CheckpointExecution,
        snapshot: &CheckpointDefinition,
    ) -> Result<Step> {
        if snapshot.requires_approval_to_complete {
            execution.status = ExecutionStatus::WaitingApprovalToComplete;
            self.store.write(|tx| store::update_execution(tx, &execution))?;
            info!(execution_id = %execution.id, "waiting for approval to complete");
            return Ok(Step::Waiting);
        }
        self.complete(execution, None)
    }

    pub fn approve_complete(&self, execution_id: &str) -> Result<Step> {
        let (execution, _) = self.load(execution_id)?;
        expect_status(&execution, &[ExecutionStatus::WaitingApprovalToComplete])?;
        self.complete(execution, Some(InteractionKind::ApprovalToComplete))
    }

    /// Promote staged artifacts and mark completed in one transaction.
    fn complete(
        &self,
        mut execution: CheckpointExecution,
        interaction: Option<InteractionKind>,
    ) -> Result<Step> {
        let pending = self.artifacts.prepare_promotion(&execution)?;
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(Utc::now());

        let committed = self.store.write(|tx| {
            pending.record(tx)?;
            if let Some(kind) = interaction {
                store::insert_interaction(tx, &execution.id, kind, None, None)?;
            }
            store::update_execution(tx, &execution)?;
            store::insert_event(
                tx,
                Some(&execution.run_id),
                "checkpoint_completed",
                &format!(
                    "checkpoint {} at position {} completed",
                    execution.checkpoint_id, execution.checkpoint_position
                ),
            )
        });
        if let Err(e) = committed {
            pending.discard(self.mirror.as_ref());
            return Err(e);
        }

        info!(
            execution_id = %execution.id,
            artifacts = pending.files.len(),
            "execution completed"
        );
        Ok(Step::Completed)
    }

    /// Send work back for another pass, or fail once the budget is spent.
    pub fn request_revision(&self, execution_id: &str, feedback: &str) -> Result<Step> {
        let (mut execution, snapshot) = self.load(execution_id)?;
        expect_status(&execution, &[ExecutionStatus::WaitingApprovalToComplete])?;

        if execution.revision_iteration >= i64::from(snapshot.max_revision_iterations) {
            self.store.write(|tx| {
                store::insert_interaction(
                    tx,
                    execution_id,
                    InteractionKind::RevisionRequest,
                    Some(feedback),
                    None,
                )
            })?;
            let message = format!(
                "revision limit of {} reached",
                snapshot.max_revision_iterations
            );
            let action = snapshot.retry.on_failure;
            return self.fail(execution, &snapshot, &message, action);
        }

        execution.revision_iteration += 1;
        execution.status = ExecutionStatus::InProgress;
        self.store.write(|tx| {
            store::insert_interaction(
                tx,
                execution_id,
                InteractionKind::RevisionRequest,
                Some(feedback),
                None,
            )?;
            store::update_execution(tx, &execution)
        })?;
        info!(
            execution_id,
            iteration = execution.revision_iteration,
            "revision requested"
        );

        if snapshot.mode.is_human() {
            return Ok(Step::Waiting);
        }
        let input = self.resolver.build_input_context(&execution, &snapshot)?;
        self.prepare(&execution, snapshot, input, Duration::ZERO)
            .map(Step::Invoke)
    }

    /// Mark the execution failed and keep a copy of its workspace.
    fn fail(
        &self,
        mut execution: CheckpointExecution,
        snapshot: &CheckpointDefinition,
        message: &str,
        action: FailureAction,
    ) -> Result<Step> {
        let now = Utc::now();
        let layout = self.mirror.layout();
        let workspace = layout.exec_dir(&execution.id);
        if self.mirror.exists(&workspace) {
            let errored = layout.errored_exec_dir(&execution.id, now);
            if let Err(e) = self.mirror.copy_tree(&workspace, &errored) {
                warn!(execution_id = %execution.id, error = %e, "failed to keep errored workspace");
            }
        }

        execution.status = ExecutionStatus::Failed;
        execution.failed_at = Some(now);
        execution.last_error = Some(message.to_string());
        execution.failure_action = Some(action);
        self.store.write(|tx| {
            store::insert_log(tx, &execution.id, LogLevel::Error, message)?;
            store::update_execution(tx, &execution)?;
            store::insert_event(
                tx,
                Some(&execution.run_id),
                "checkpoint_failed",
                &format!("checkpoint {} failed: {message}", snapshot.id),
            )
        })?;

        error!(
            execution_id = %execution.id,
            error = message,
            action = action.as_str(),
            "execution failed"
        );
        Ok(Step::Failed(action))
    }

    fn load(&self, execution_id: &str) -> Result<(CheckpointExecution, CheckpointDefinition)> {
        self.store.read(|c| {
            Ok((
                store::get_execution(c, execution_id)?,
                store::execution_snapshot(c, execution_id)?,
            ))
        })
    }
}

fn expect_status(execution: &CheckpointExecution, allowed: &[ExecutionStatus]) -> Result<()> {
    if allowed.contains(&execution.status) {
        return Ok(());
    }
    let expected: Vec<&str> = allowed.iter().map(ExecutionStatus::as_str).collect();
    Err(GatehouseError::conflict(format!(
        "execution {} is {}, expected {}",
        execution.id,
        execution.status,
        expected.join(" or ")
    )))
}

/// Check required fields and basic value types.
fn validate_form(config: &HumanOnlyConfig, fields: &Map<String, Value>) -> Result<()> {
    for field in &config.input_fields {
        let value = fields.get(&field.name).filter(|v| !is_blank(v));
        let Some(value) = value else {
            if field.required {
                return Err(GatehouseError::missing_field(&field.name));
            }
            continue;
        };
        let ok = match field.field_type {
            FieldType::Number => {
                value.is_number()
                    || value.as_str().is_some_and(|s| s.trim().parse::<f64>().is_ok())
            }
            FieldType::Boolean => value.is_boolean(),
            FieldType::Text | FieldType::MultilineText | FieldType::File => value.is_string(),
        };
        if !ok {
            return Err(GatehouseError::invalid_field(
                &field.name,
                format!("expected a {:?} value", field.field_type).to_lowercase(),
            ));
        }
    }
    Ok(())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Render submitted fields as the form artifact's content.
fn render_form(fields: &Map<String, Value>, format: ArtifactFormat) -> Result<Vec<u8>> {
    match format {
        ArtifactFormat::Md => {
            let mut out = String::from("# Form Data\n\n");
            for (key, value) in fields {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&format!("**{key}**: {text}\n\n"));
            }
            Ok(out.into_bytes())
        }
        _ => Ok(serde_json::to_vec_pretty(fields)?),
    }
}
