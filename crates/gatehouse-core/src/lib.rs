//! Run and checkpoint orchestration for Gatehouse pipelines.
//!
//! A pipeline is an ordered list of checkpoints. Each run of it gets a
//! version, walks the checkpoints one execution at a time, and promotes each
//! execution's staged artifacts into `runs/v{N}/` once approved. SQLite is the
//! store of record; the directory tree under the pipeline root is a derived
//! mirror that [`ConsistencyChecker`] can regenerate.
//!
//! [`Orchestrator`] is the command surface. The pieces behind it:
//!
//! - [`ArtifactStore`]: staging and all-or-nothing promotion
//! - [`VersionResolver`]: run lineage and input references
//! - [`ExecutionMachine`]: the per-execution state machine
//! - [`RunManager`]: the run state machine and sequential advance
//! - [`RollbackEngine`]: archive-before-delete rollbacks

pub mod artifacts;
pub mod capability;
pub mod config;
pub mod consistency;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod execution;
pub mod layout;
pub mod locks;
pub mod mirror;
pub mod resolver;
pub mod rollback;
pub mod run;
pub mod store;
pub mod types;

pub use artifacts::{ArtifactStore, PendingPromotion, sha256_hex};
pub use capability::{DeferredCapability, ExecutionCapability, ExecutionReply, ExecutionRequest};
pub use config::EngineConfig;
pub use consistency::{ConsistencyChecker, ConsistencyReport, Drift};
pub use definitions::{
    CheckpointDefinition, DefinitionCatalog, DefinitionFile, DefinitionSource, ExecutionMode,
    FailureAction, Pipeline,
};
pub use engine::Orchestrator;
pub use error::{CommandStatus, GatehouseError, Result, status_of};
pub use execution::{Attempt, ExecutionMachine, Step};
pub use layout::Layout;
pub use mirror::{LocalMirror, Mirror};
pub use resolver::VersionResolver;
pub use rollback::RollbackEngine;
pub use run::{RunInfo, RunManager};
pub use store::Store;
pub use types::{
    ArchivedItem, Artifact, ArtifactFormat, CheckpointExecution, ExecutionStatus, InputContext,
    PipelineRun, ProducedArtifact, RollbackEvent, RunStatus, RunSummary,
};
