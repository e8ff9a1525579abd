//! The single seam through which agent and script work is invoked.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::definitions::CheckpointDefinition;
use crate::types::{InputContext, ProducedArtifact};

/// Everything an executor needs for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub run_id: String,
    pub run_version: i64,
    /// Definition captured when the execution was created.
    pub checkpoint: CheckpointDefinition,
    pub attempt_number: i64,
    pub revision_iteration: i64,
    /// Absolute path of the execution's scratch workspace.
    pub workspace: PathBuf,
    pub input: InputContext,
}

/// What an executor reports back from `execute`.
#[derive(Debug, Clone)]
pub enum ExecutionReply {
    /// Work finished; stage these artifacts.
    Produced(Vec<ProducedArtifact>),
    /// Work continues out of band and will re-enter through
    /// `report_success` or `report_failure`.
    Deferred,
}

/// External executor for `agentic` and `script` checkpoints.
///
/// Any error is treated as a retryable failure of the current attempt.
#[async_trait]
pub trait ExecutionCapability: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionReply>;
}

/// Capability that hands every request off to an external party.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferredCapability;

#[async_trait]
impl ExecutionCapability for DeferredCapability {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionReply> {
        tracing::info!(
            execution_id = %request.execution_id,
            mode = request.checkpoint.mode.as_str(),
            attempt = request.attempt_number,
            "execution deferred to external executor"
        );
        Ok(ExecutionReply::Deferred)
    }
}
