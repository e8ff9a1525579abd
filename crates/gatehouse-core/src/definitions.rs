//! Pipeline and checkpoint definitions.
//!
//! Definitions are owned by an external collaborator; the engine only reads
//! them through [`DefinitionSource`]. [`DefinitionCatalog`] is the in-process
//! implementation, loaded from TOML files.
//!
//! # Example TOML
//!
//! ```toml
//! [pipeline]
//! id = "blog-post"
//! name = "Blog post"
//! order = ["outline", "draft"]
//!
//! [[checkpoints]]
//! id = "outline"
//! name = "Outline"
//! requires_approval_to_complete = true
//!
//! [checkpoints.mode]
//! type = "human_only"
//! instructions = "Describe the post"
//!
//! [[checkpoints.mode.input_fields]]
//! name = "topic"
//! type = "text"
//! required = true
//!
//! [[checkpoints]]
//! id = "draft"
//! name = "Draft"
//! mode = { type = "agentic", prompt = "Write a draft from the outline" }
//! outputs = [{ id = "draft", name = "draft", format = "md" }]
//! inputs = { include_checkpoint_outputs = ["outline"] }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ArtifactFormat, text_enum};
use crate::{GatehouseError, Result};

/// Upper bound for `max_auto_retries`.
pub const MAX_AUTO_RETRIES: u32 = 5;
/// Upper bound for `max_revision_iterations`.
pub const MAX_REVISION_ITERATIONS: u32 = 5;
/// Upper bound for a checkpoint timeout.
pub const MAX_CHECKPOINT_TIMEOUT_MINUTES: u64 = 480;
/// Revision budget when a checkpoint does not declare one.
pub const DEFAULT_MAX_REVISION_ITERATIONS: u32 = 3;

/// Pipeline identity plus its ordered checkpoint list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Checkpoint ids in execution order.
    #[serde(default)]
    pub order: Vec<String>,
    /// Bumped whenever `order` changes.
    #[serde(default = "default_definition_version")]
    pub definition_version: i64,
    #[serde(default = "default_true")]
    pub auto_advance: bool,
}

impl Pipeline {
    pub fn new(id: &str, order: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            order,
            definition_version: 1,
            auto_advance: true,
        }
    }
}

/// One step of a pipeline. Its position comes from the pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub requires_approval_to_start: bool,
    #[serde(default)]
    pub requires_approval_to_complete: bool,
    #[serde(default = "default_revisions")]
    pub max_revision_iterations: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Bounds each call into the execution capability.
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    /// Artifacts this checkpoint is expected to produce.
    #[serde(default)]
    pub outputs: Vec<OutputArtifact>,
    #[serde(default)]
    pub inputs: InputReferences,
}

impl CheckpointDefinition {
    /// A human-only checkpoint with no fields and no approvals.
    pub fn human(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            mode: ExecutionMode::HumanOnly(HumanOnlyConfig::default()),
            requires_approval_to_start: false,
            requires_approval_to_complete: false,
            max_revision_iterations: DEFAULT_MAX_REVISION_ITERATIONS,
            retry: RetryPolicy::default(),
            timeout_minutes: None,
            outputs: Vec::new(),
            inputs: InputReferences::default(),
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Artifact id for a produced artifact name: the declared output's id
    /// when one matches, otherwise the name itself.
    pub fn artifact_id_for(&self, name: &str) -> String {
        self.outputs
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.id.clone())
            .unwrap_or_else(|| name.to_string())
    }
}

/// How a checkpoint does its work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    HumanOnly(HumanOnlyConfig),
    Agentic(AgenticConfig),
    Script(ScriptConfig),
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HumanOnly(_) => "human_only",
            Self::Agentic(_) => "agentic",
            Self::Script(_) => "script",
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::HumanOnly(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanOnlyConfig {
    pub instructions: String,
    pub input_fields: Vec<InputField>,
    /// Stage submitted form data as an artifact.
    pub save_as_artifact: Option<FormArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Boolean,
    File,
    MultilineText,
}

/// Where submitted form data lands when it is kept as an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormArtifact {
    pub id: String,
    pub name: String,
    #[serde(default = "default_form_format")]
    pub format: ArtifactFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgenticConfig {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Inline script body, written into the workspace by the executor.
    pub script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_auto_retries: u32,
    pub on_failure: FailureAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auto_retries: 0,
            on_failure: FailureAction::PausePipeline,
        }
    }
}

/// What the run does once an execution fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    RollbackCheckpoint,
    #[default]
    PausePipeline,
}

text_enum!(FailureAction {
    RollbackCheckpoint => "rollback_checkpoint",
    PausePipeline => "pause_pipeline",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub id: String,
    pub name: String,
    pub format: ArtifactFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputReferences {
    /// Feed the same position's promoted artifacts from the previous run.
    pub include_previous_version: bool,
    /// Earlier checkpoints of this run whose outputs are inputs here.
    pub include_checkpoint_outputs: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_definition_version() -> i64 {
    1
}

fn default_revisions() -> u32 {
    DEFAULT_MAX_REVISION_ITERATIONS
}

fn default_form_format() -> ArtifactFormat {
    ArtifactFormat::Json
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl CheckpointDefinition {
    /// Validate ids and the system limits.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(GatehouseError::Definition(
                "Checkpoint ID cannot be empty".into(),
            ));
        }
        if self.retry.max_auto_retries > MAX_AUTO_RETRIES {
            return Err(GatehouseError::Definition(format!(
                "Checkpoint {}: max_auto_retries {} exceeds {}",
                self.id, self.retry.max_auto_retries, MAX_AUTO_RETRIES
            )));
        }
        if self.max_revision_iterations > MAX_REVISION_ITERATIONS {
            return Err(GatehouseError::Definition(format!(
                "Checkpoint {}: max_revision_iterations {} exceeds {}",
                self.id, self.max_revision_iterations, MAX_REVISION_ITERATIONS
            )));
        }
        if let Some(minutes) = self.timeout_minutes
            && (minutes == 0 || minutes > MAX_CHECKPOINT_TIMEOUT_MINUTES)
        {
            return Err(GatehouseError::Definition(format!(
                "Checkpoint {}: timeout_minutes must be between 1 and {}",
                self.id, MAX_CHECKPOINT_TIMEOUT_MINUTES
            )));
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if output.id.trim().is_empty() || !seen.insert(&output.id) {
                return Err(GatehouseError::Definition(format!(
                    "Checkpoint {}: output ids must be unique and non-empty",
                    self.id
                )));
            }
        }

        if let ExecutionMode::HumanOnly(config) = &self.mode {
            let mut names = HashSet::new();
            for field in &config.input_fields {
                if field.name.trim().is_empty() || !names.insert(&field.name) {
                    return Err(GatehouseError::Definition(format!(
                        "Checkpoint {}: input field names must be unique and non-empty",
                        self.id
                    )));
                }
            }
            if let Some(form) = &config.save_as_artifact
                && !matches!(form.format, ArtifactFormat::Json | ArtifactFormat::Md)
            {
                return Err(GatehouseError::Definition(format!(
                    "Checkpoint {}: form artifacts must be json or md, got {}",
                    self.id, form.format
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Read-only access to versioned definitions.
pub trait DefinitionSource: Send + Sync {
    fn pipeline(&self, pipeline_id: &str) -> Result<Pipeline>;
    fn checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointDefinition>;
}

/// Top-level wrapper matching the TOML structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefinitionFile {
    pub pipeline: Pipeline,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointDefinition>,
}

impl DefinitionFile {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| GatehouseError::Definition(format!("TOML parse error: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatehouseError::Definition(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Checks:
    /// - Pipeline id is non-empty
    /// - Checkpoint ids are unique and individually valid
    /// - The order only names declared checkpoints, each once
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.id.trim().is_empty() {
            return Err(GatehouseError::Definition(
                "Pipeline ID cannot be empty".into(),
            ));
        }

        let mut ids = HashSet::new();
        for checkpoint in &self.checkpoints {
            checkpoint.validate()?;
            if !ids.insert(checkpoint.id.as_str()) {
                return Err(GatehouseError::Definition(format!(
                    "Duplicate checkpoint ID: {}",
                    checkpoint.id
                )));
            }
        }

        let mut ordered = HashSet::new();
        for id in &self.pipeline.order {
            if !ids.contains(id.as_str()) {
                return Err(GatehouseError::Definition(format!(
                    "Pipeline order references unknown checkpoint: {id}"
                )));
            }
            if !ordered.insert(id.as_str()) {
                return Err(GatehouseError::Definition(format!(
                    "Checkpoint {id} appears twice in the pipeline order"
                )));
            }
        }
        Ok(())
    }
}

/// In-memory catalog of pipelines and checkpoints.
#[derive(Debug, Default)]
pub struct DefinitionCatalog {
    pipelines: RwLock<HashMap<String, Pipeline>>,
    checkpoints: RwLock<HashMap<String, CheckpointDefinition>>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parsed definition file after validating it.
    pub fn insert_file(&self, file: DefinitionFile) -> Result<()> {
        file.validate()?;
        debug!(
            pipeline = %file.pipeline.id,
            checkpoints = file.checkpoints.len(),
            "registering pipeline definition"
        );
        let mut checkpoints = self.checkpoints.write();
        for checkpoint in file.checkpoints {
            checkpoints.insert(checkpoint.id.clone(), checkpoint);
        }
        self.pipelines
            .write()
            .insert(file.pipeline.id.clone(), file.pipeline);
        Ok(())
    }

    /// Load every `*.toml` file in `dir`.
    ///
    /// Unparseable files are skipped with a warning so one bad file does not
    /// hide the others. Returns the number of pipelines loaded.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut loaded = 0;
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        entries.sort();

        for path in entries {
            match DefinitionFile::from_file(&path).and_then(|f| self.insert_file(f)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping definition file"),
            }
        }
        Ok(loaded)
    }

    /// Replace the checkpoint order, bumping the definition version.
    pub fn set_checkpoint_order(&self, pipeline_id: &str, order: Vec<String>) -> Result<i64> {
        let known = self.checkpoints.read();
        if let Some(unknown) = order.iter().find(|id| !known.contains_key(*id)) {
            return Err(GatehouseError::Definition(format!(
                "Pipeline order references unknown checkpoint: {unknown}"
            )));
        }
        let mut pipelines = self.pipelines.write();
        let pipeline = pipelines
            .get_mut(pipeline_id)
            .ok_or_else(|| GatehouseError::not_found("pipeline", pipeline_id))?;
        if pipeline.order != order {
            pipeline.order = order;
            pipeline.definition_version += 1;
        }
        Ok(pipeline.definition_version)
    }

    /// Replace a checkpoint's content. The owning pipeline's version is untouched.
    pub fn update_checkpoint(&self, checkpoint: CheckpointDefinition) -> Result<()> {
        checkpoint.validate()?;
        self.checkpoints
            .write()
            .insert(checkpoint.id.clone(), checkpoint);
        Ok(())
    }

    pub fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl DefinitionSource for DefinitionCatalog {
    fn pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        self.pipelines
            .read()
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| GatehouseError::not_found("pipeline", pipeline_id))
    }

    fn checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointDefinition> {
        self.checkpoints
            .read()
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| GatehouseError::not_found("checkpoint", checkpoint_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[pipeline]
id = "blog-post"
name = "Blog post"
order = ["outline", "draft"]

[[checkpoints]]
id = "outline"
name = "Outline"
requires_approval_to_complete = true

[checkpoints.mode]
type = "human_only"
instructions = "Describe the post"

[[checkpoints.mode.input_fields]]
name = "topic"
type = "text"
required = true

[[checkpoints]]
id = "draft"
name = "Draft"
timeout_minutes = 30
mode = { type = "agentic", prompt = "Write a draft" }
outputs = [{ id = "draft", name = "draft", format = "md" }]
inputs = { include_checkpoint_outputs = ["outline"] }
retry = { max_auto_retries = 2, on_failure = "rollback_checkpoint" }
"#;

    #[test]
    fn test_parse_sample() {
        let file = DefinitionFile::from_toml(SAMPLE).unwrap();
        file.validate().unwrap();
        assert_eq!(file.pipeline.definition_version, 1);
        assert!(file.pipeline.auto_advance);

        let outline = &file.checkpoints[0];
        assert!(outline.requires_approval_to_complete);
        assert_eq!(outline.max_revision_iterations, DEFAULT_MAX_REVISION_ITERATIONS);
        match &outline.mode {
            ExecutionMode::HumanOnly(config) => {
                assert_eq!(config.input_fields.len(), 1);
                assert!(config.input_fields[0].required);
            }
            other => panic!("unexpected mode {}", other.as_str()),
        }

        let draft = &file.checkpoints[1];
        assert_eq!(draft.mode.as_str(), "agentic");
        assert_eq!(draft.retry.max_auto_retries, 2);
        assert_eq!(draft.retry.on_failure, FailureAction::RollbackCheckpoint);
        assert_eq!(draft.artifact_id_for("draft"), "draft");
        assert_eq!(draft.artifact_id_for("notes"), "notes");
    }

    #[test]
    fn test_validate_rejects_limits() {
        let mut cp = CheckpointDefinition::human("a");
        cp.retry.max_auto_retries = MAX_AUTO_RETRIES + 1;
        assert!(cp.validate().is_err());

        let mut cp = CheckpointDefinition::human("a");
        cp.timeout_minutes = Some(MAX_CHECKPOINT_TIMEOUT_MINUTES + 1);
        assert!(cp.validate().is_err());

        let mut cp = CheckpointDefinition::human("a");
        cp.mode = ExecutionMode::HumanOnly(HumanOnlyConfig {
            save_as_artifact: Some(FormArtifact {
                id: "form".into(),
                name: "form".into(),
                format: ArtifactFormat::Csv,
            }),
            ..Default::default()
        });
        assert!(cp.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_order() {
        let file = DefinitionFile {
            pipeline: Pipeline::new("p", vec!["missing".into()]),
            checkpoints: vec![CheckpointDefinition::human("a")],
        };
        assert!(matches!(file.validate(), Err(GatehouseError::Definition(_))));
    }

    #[test]
    fn test_reorder_bumps_version_but_edit_does_not() {
        let catalog = DefinitionCatalog::new();
        catalog
            .insert_file(DefinitionFile {
                pipeline: Pipeline::new("p", vec!["a".into(), "b".into()]),
                checkpoints: vec![
                    CheckpointDefinition::human("a"),
                    CheckpointDefinition::human("b"),
                ],
            })
            .unwrap();

        let mut edited = CheckpointDefinition::human("a");
        edited.description = "changed".into();
        catalog.update_checkpoint(edited).unwrap();
        assert_eq!(catalog.pipeline("p").unwrap().definition_version, 1);

        let version = catalog
            .set_checkpoint_order("p", vec!["b".into(), "a".into()])
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(catalog.pipeline("p").unwrap().order, vec!["b", "a"]);
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.toml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("bad.toml"), "not = [valid").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = DefinitionCatalog::new();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(catalog.pipeline_ids(), vec!["blog-post"]);
        assert!(catalog.checkpoint("draft").is_ok());
        assert!(matches!(
            catalog.checkpoint("nope"),
            Err(GatehouseError::NotFound { .. })
        ));
    }
}
