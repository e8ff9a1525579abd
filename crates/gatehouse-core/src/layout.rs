//! On-disk layout of a pipeline root.
//!
//! # Directory Layout
//!
//! ```text
//! {pipeline_id}/
//! ├── .pipeline_system/
//! │   ├── db/state.db                   # store of record
//! │   ├── definitions/*.toml
//! │   └── logs/
//! ├── runs/
//! │   ├── v{N}/run_info.json
//! │   ├── v{N}/checkpoint_{pos}_{name}/outputs/{artifact}_{id}_v{N}.{fmt}
//! │   └── latest -> v{N}
//! ├── .temp/exec_{execution_id}/{workspace,artifacts_staging}/
//! ├── .archived/rollback_{rollback_id}_{datetime}/archived_data/
//! └── .errored/exec_{execution_id}_{datetime}/
//! ```
//!
//! Paths persisted in the store of record are relative to the root; use
//! [`Layout::resolve`] to turn them back into absolute paths.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::types::ArtifactFormat;

const SYSTEM_DIR: &str = ".pipeline_system";
const DB_DIR: &str = "db";
const DB_FILENAME: &str = "state.db";
const DEFINITIONS_DIR: &str = "definitions";
const LOGS_DIR: &str = "logs";
const RUNS_DIR: &str = "runs";
const LATEST_LINK: &str = "latest";
const TEMP_DIR: &str = ".temp";
const ARCHIVED_DIR: &str = ".archived";
const ERRORED_DIR: &str = ".errored";
const WORKSPACE_DIR: &str = "workspace";
const STAGING_DIR: &str = "artifacts_staging";
const OUTPUTS_DIR: &str = "outputs";

/// Subfolder of a rollback folder holding the archived copies.
pub const ARCHIVED_DATA_DIR: &str = "archived_data";
/// File written into each run directory.
pub const RUN_INFO_FILE: &str = "run_info.json";
/// Timestamp format used in archive and errored folder names.
pub const FOLDER_TIMESTAMP: &str = "%Y%m%d_%H%M%S";

/// Path conventions for one pipeline root. Holds no state besides the root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a path stored relative to the root.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        }
    }

    /// Strip the root, for persisting.
    pub fn relative(&self, absolute: &Path) -> PathBuf {
        absolute
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| absolute.to_path_buf())
    }

    pub fn system_dir(&self) -> PathBuf {
        self.root.join(SYSTEM_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.system_dir().join(DB_DIR).join(DB_FILENAME)
    }

    pub fn definitions_dir(&self) -> PathBuf {
        self.system_dir().join(DEFINITIONS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.system_dir().join(LOGS_DIR)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join(RUNS_DIR)
    }

    pub fn latest_link(&self) -> PathBuf {
        self.runs_dir().join(LATEST_LINK)
    }

    pub fn run_dir(&self, run_version: i64) -> PathBuf {
        self.runs_dir().join(run_dir_name(run_version))
    }

    pub fn run_info_path(&self, run_version: i64) -> PathBuf {
        self.run_dir(run_version).join(RUN_INFO_FILE)
    }

    pub fn checkpoint_dir(
        &self,
        run_version: i64,
        position: i64,
        checkpoint_name: &str,
    ) -> PathBuf {
        self.run_dir(run_version)
            .join(format!("checkpoint_{}_{}", position, dir_safe(checkpoint_name)))
    }

    pub fn outputs_dir(&self, run_version: i64, position: i64, checkpoint_name: &str) -> PathBuf {
        self.checkpoint_dir(run_version, position, checkpoint_name)
            .join(OUTPUTS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn exec_dir(&self, execution_id: &str) -> PathBuf {
        self.temp_dir().join(format!("exec_{execution_id}"))
    }

    pub fn workspace_dir(&self, execution_id: &str) -> PathBuf {
        self.exec_dir(execution_id).join(WORKSPACE_DIR)
    }

    pub fn staging_dir(&self, execution_id: &str) -> PathBuf {
        self.exec_dir(execution_id).join(STAGING_DIR)
    }

    pub fn staged_artifact_path(
        &self,
        execution_id: &str,
        name: &str,
        artifact_id: &str,
        format: ArtifactFormat,
    ) -> PathBuf {
        self.staging_dir(execution_id)
            .join(format!("{}_{}.{}", dir_safe(name), dir_safe(artifact_id), format))
    }

    pub fn promoted_artifact_path(
        &self,
        run_version: i64,
        position: i64,
        checkpoint_name: &str,
        name: &str,
        artifact_id: &str,
        format: ArtifactFormat,
    ) -> PathBuf {
        self.outputs_dir(run_version, position, checkpoint_name).join(format!(
            "{}_{}_v{}.{}",
            dir_safe(name),
            dir_safe(artifact_id),
            run_version,
            format
        ))
    }

    pub fn archived_dir(&self) -> PathBuf {
        self.root.join(ARCHIVED_DIR)
    }

    /// Folder for one rollback. The id keeps folders unique even when two
    /// rollbacks land in the same second.
    pub fn rollback_dir(&self, rollback_id: &str, at: DateTime<Utc>) -> PathBuf {
        self.archived_dir().join(format!(
            "rollback_{}_{}",
            rollback_id,
            at.format(FOLDER_TIMESTAMP)
        ))
    }

    pub fn errored_dir(&self) -> PathBuf {
        self.root.join(ERRORED_DIR)
    }

    pub fn errored_exec_dir(&self, execution_id: &str, at: DateTime<Utc>) -> PathBuf {
        self.errored_dir()
            .join(format!("exec_{}_{}", execution_id, at.format(FOLDER_TIMESTAMP)))
    }

    /// Directories created when a pipeline root is initialised.
    pub fn skeleton(&self) -> Vec<PathBuf> {
        vec![
            self.db_path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.system_dir()),
            self.definitions_dir(),
            self.logs_dir(),
            self.runs_dir(),
            self.temp_dir(),
            self.archived_dir(),
            self.errored_dir(),
        ]
    }
}

/// `v{N}`, the directory name of a run version.
pub fn run_dir_name(run_version: i64) -> String {
    format!("v{run_version}")
}

/// Parse a `v{N}` directory name.
pub fn parse_run_dir_name(name: &str) -> Option<i64> {
    name.strip_prefix('v')?.parse().ok()
}

/// Replace anything outside `[A-Za-z0-9_-]` so names are safe path segments.
pub fn dir_safe(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
