//! Runtime entities owned by the store of record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definitions::FailureAction;

/// Implements `as_str`, `Display` and `parse` for enums persisted as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

/// Run-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Paused,
    Completed,
    Failed,
}

text_enum!(RunStatus {
    NotStarted => "not_started",
    InProgress => "in_progress",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

/// Lifecycle of one checkpoint execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    WaitingApprovalToStart,
    InProgress,
    WaitingApprovalToComplete,
    Completed,
    Failed,
}

text_enum!(ExecutionStatus {
    Pending => "pending",
    WaitingApprovalToStart => "waiting_approval_to_start",
    InProgress => "in_progress",
    WaitingApprovalToComplete => "waiting_approval_to_complete",
    Completed => "completed",
    Failed => "failed",
});

/// One versioned, end-to-end pass over a pipeline's checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub run_version: i64,
    pub status: RunStatus,
    pub current_checkpoint_id: Option<String>,
    pub current_position: Option<i64>,
    /// Highest non-archived prior run at creation time, or the explicit base.
    pub previous_run_id: Option<String>,
    pub extends_from_run_version: Option<i64>,
    /// Pipeline definition version captured at creation.
    pub definition_version: i64,
    /// Checkpoint order captured at creation; positions index into it.
    pub checkpoint_order: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub last_resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn checkpoint_at(&self, position: i64) -> Option<&str> {
        usize::try_from(position)
            .ok()
            .and_then(|p| self.checkpoint_order.get(p))
            .map(String::as_str)
    }

    pub fn total_checkpoints(&self) -> i64 {
        self.checkpoint_order.len() as i64
    }
}

/// Runtime instance of one checkpoint within one run.
///
/// The id and temp workspace are stable across retries and revisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointExecution {
    pub id: String,
    pub run_id: String,
    pub checkpoint_id: String,
    pub checkpoint_name: String,
    pub checkpoint_position: i64,
    pub status: ExecutionStatus,
    pub attempt_number: i64,
    pub revision_iteration: i64,
    /// Relative to the pipeline root.
    pub temp_workspace_path: PathBuf,
    /// Relative to the pipeline root.
    pub permanent_output_path: PathBuf,
    pub form_data: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub failure_action: Option<FailureAction>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// A file produced by an execution, staged first and promoted on approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Defined by the checkpoint, shared by every run.
    pub id: String,
    pub execution_id: String,
    pub run_id: String,
    pub name: String,
    pub format: ArtifactFormat,
    pub size_bytes: i64,
    /// Hex-encoded SHA-256 of the content.
    pub checksum: String,
    pub staged_path: PathBuf,
    pub promoted_path: Option<PathBuf>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn is_promoted(&self) -> bool {
        self.promoted_at.is_some()
    }
}

/// File formats an artifact may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Json,
    Md,
    Mmd,
    Txt,
    Py,
    Html,
    Csv,
}

text_enum!(ArtifactFormat {
    Json => "json",
    Md => "md",
    Mmd => "mmd",
    Txt => "txt",
    Py => "py",
    Html => "html",
    Csv => "csv",
});

/// Artifact content handed back by an execution capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub name: String,
    pub format: ArtifactFormat,
    pub content: Vec<u8>,
}

impl ProducedArtifact {
    pub fn text(name: &str, format: ArtifactFormat, content: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            format,
            content: content.into().into_bytes(),
        }
    }
}

/// Human decision recorded against an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    ApprovalToStart,
    ApprovalToComplete,
    RevisionRequest,
    FormSubmission,
}

text_enum!(InteractionKind {
    ApprovalToStart => "approval_to_start",
    ApprovalToComplete => "approval_to_complete",
    RevisionRequest => "revision_request",
    FormSubmission => "form_submission",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub execution_id: String,
    pub kind: InteractionKind,
    pub feedback: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

text_enum!(LogLevel {
    Info => "info",
    Warning => "warning",
    Error => "error",
});

/// Audit line attached to an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub execution_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Pipeline-level audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub run_id: Option<String>,
    pub kind: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    CheckpointLevel,
    RunLevel,
}

text_enum!(RollbackKind {
    CheckpointLevel => "checkpoint_level",
    RunLevel => "run_level",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    UserRequest,
    CheckpointFailure,
}

text_enum!(RollbackTrigger {
    UserRequest => "user_request",
    CheckpointFailure => "checkpoint_failure",
});

/// Ids removed by one rollback, all moved into the same archive folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolledBackItems {
    pub deleted_runs: Vec<String>,
    pub deleted_executions: Vec<String>,
    pub archived_artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: String,
    pub kind: RollbackKind,
    pub source_run_id: String,
    pub source_run_version: i64,
    pub target_run_id: String,
    pub target_checkpoint_id: String,
    pub target_position: i64,
    /// Relative to the pipeline root.
    pub archive_location: PathBuf,
    pub triggered_by: RollbackTrigger,
    pub reason: Option<String>,
    pub items: RolledBackItems,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivedItemType {
    Run,
    CheckpointExecution,
    Artifact,
}

text_enum!(ArchivedItemType {
    Run => "run",
    CheckpointExecution => "checkpoint_execution",
    Artifact => "artifact",
});

/// One entry of a rollback archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedItem {
    pub rollback_id: String,
    pub item_type: ArchivedItemType,
    pub item_id: String,
    pub original_path: PathBuf,
    pub archived_path: PathBuf,
    pub size_bytes: i64,
}

/// Artifacts handed to an execution as input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputContext {
    /// Promoted artifacts of the same position in the previous run version.
    pub previous_version: Vec<Artifact>,
    /// Promoted artifacts of earlier checkpoints of this run, by checkpoint id.
    pub checkpoint_outputs: BTreeMap<String, Vec<Artifact>>,
    /// Feedback from the latest revision request, if any.
    pub revision_feedback: Option<String>,
}

/// Read model returned by `get_run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: PipelineRun,
    pub completed_checkpoints: i64,
    pub total_checkpoints: i64,
    pub current_execution: Option<CheckpointExecution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::WaitingApprovalToStart,
            ExecutionStatus::InProgress,
            ExecutionStatus::WaitingApprovalToComplete,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("paused"), Some(RunStatus::Paused));
        assert_eq!(RunStatus::parse("archived"), None);
    }

    #[test]
    fn test_serde_matches_text() {
        let json = serde_json::to_string(&ExecutionStatus::WaitingApprovalToComplete).unwrap();
        assert_eq!(json, "\"waiting_approval_to_complete\"");
        let fmt: ArtifactFormat = serde_json::from_str("\"mmd\"").unwrap();
        assert_eq!(fmt, ArtifactFormat::Mmd);
    }

    #[test]
    fn test_checkpoint_at() {
        let run = PipelineRun {
            id: "r".into(),
            pipeline_id: "p".into(),
            run_version: 1,
            status: RunStatus::NotStarted,
            current_checkpoint_id: None,
            current_position: None,
            previous_run_id: None,
            extends_from_run_version: None,
            definition_version: 1,
            checkpoint_order: vec!["a".into(), "b".into()],
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            last_resumed_at: None,
            completed_at: None,
            failed_at: None,
        };
        assert_eq!(run.checkpoint_at(1), Some("b"));
        assert_eq!(run.checkpoint_at(2), None);
        assert_eq!(run.checkpoint_at(-1), None);
        assert_eq!(run.total_checkpoints(), 2);
    }
}
