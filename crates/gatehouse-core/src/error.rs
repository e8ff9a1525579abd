//! Error types for the orchestration engine.

use serde::Serialize;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, GatehouseError>;

/// Errors that can occur while driving runs and executions.
#[derive(Debug, Error)]
pub enum GatehouseError {
    /// Bad input from the caller, e.g. a missing required form field.
    #[error("Validation failed: {message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// The requested transition is not valid for the entity's current status.
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// A referenced checkpoint has not completed in the current run.
    #[error("Checkpoint '{checkpoint_id}' has not completed in run {run_id}")]
    UnmetDependency {
        run_id: String,
        checkpoint_id: String,
    },

    /// The external execution capability failed.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// Copying data into a rollback archive failed. Nothing was deleted.
    #[error("Archival failed: {0}")]
    ArchivalFailure(String),

    /// The file mirror diverged from the store of record.
    #[error("Mirror drift: {0}")]
    ConsistencyDrift(String),

    /// The pipeline cannot be run as defined.
    #[error("Invalid pipeline state: {0}")]
    InvalidPipelineState(String),

    /// A pipeline or checkpoint definition is malformed.
    #[error("Invalid definition: {0}")]
    Definition(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outcome class returned to the transport layer for every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    ValidationError,
    Conflict,
    NotFound,
    Internal,
}

impl GatehouseError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::Validation {
            field: Some(field.to_string()),
            message: format!("required field '{field}' is missing"),
        }
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.to_string()),
            message: format!("field '{field}': {}", message.into()),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::StateConflict(message.into())
    }

    /// Map this error onto the status classes exposed by the command surface.
    pub fn status(&self) -> CommandStatus {
        match self {
            Self::Validation { .. } | Self::Definition(_) => CommandStatus::ValidationError,
            Self::StateConflict(_)
            | Self::UnmetDependency { .. }
            | Self::InvalidPipelineState(_) => CommandStatus::Conflict,
            Self::NotFound { .. } => CommandStatus::NotFound,
            Self::ExecutionFailure(_)
            | Self::ArchivalFailure(_)
            | Self::ConsistencyDrift(_)
            | Self::Database(_)
            | Self::Migration(_)
            | Self::Io(_)
            | Self::Serde(_) => CommandStatus::Internal,
        }
    }
}

/// Status of a command result, `Success` for any `Ok`.
pub fn status_of<T>(result: &Result<T>) -> CommandStatus {
    match result {
        Ok(_) => CommandStatus::Success,
        Err(e) => e.status(),
    }
}
