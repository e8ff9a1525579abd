//! Artifact lifecycle: staging inside an execution's temp workspace, and
//! all-or-nothing promotion into versioned run storage.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::mirror::Mirror;
use crate::store::{self, Store};
use crate::types::{Artifact, ArtifactFormat, CheckpointExecution, ExecutionStatus};
use crate::{GatehouseError, Result};

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A promoted file copied into run storage but not yet recorded.
#[derive(Debug, Clone)]
pub struct PromotedFile {
    pub artifact_id: String,
    /// Relative to the pipeline root.
    pub path: PathBuf,
    pub size_bytes: i64,
    pub checksum: String,
}

/// Files copied for one execution's promotion.
///
/// Either [`record`](Self::record) it inside the transaction that completes
/// the execution, or [`discard`](Self::discard) it.
#[derive(Debug)]
#[must_use = "a pending promotion must be recorded or discarded"]
pub struct PendingPromotion {
    pub execution_id: String,
    pub files: Vec<PromotedFile>,
    pub at: DateTime<Utc>,
}

impl PendingPromotion {
    /// Mark every copied artifact promoted.
    pub fn record(&self, conn: &Connection) -> Result<()> {
        for file in &self.files {
            store::mark_promoted(
                conn,
                &self.execution_id,
                &file.artifact_id,
                &file.path,
                file.size_bytes,
                &file.checksum,
                &self.at,
            )?;
        }
        Ok(())
    }

    /// Remove the copied files after the recording transaction failed.
    pub fn discard(&self, mirror: &dyn Mirror) {
        remove_copies(mirror, self.files.iter().map(|f| &f.path));
    }
}

fn remove_copies<'a>(mirror: &dyn Mirror, paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        let abs = mirror.layout().resolve(path);
        if let Err(e) = mirror.remove_file(&abs) {
            warn!(path = %abs.display(), error = %e, "failed to remove partial promotion");
        }
    }
}

/// Stages and promotes artifacts.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<Store>,
    mirror: Arc<dyn Mirror>,
    max_artifact_bytes: u64,
}

impl ArtifactStore {
    pub fn new(store: Arc<Store>, mirror: Arc<dyn Mirror>, max_artifact_bytes: u64) -> Self {
        Self {
            store,
            mirror,
            max_artifact_bytes,
        }
    }

    /// Create `.temp/exec_{id}/{workspace,artifacts_staging}`.
    pub fn create_workspace(&self, execution_id: &str) -> Result<PathBuf> {
        let layout = self.mirror.layout();
        self.mirror.create_dir(&layout.workspace_dir(execution_id))?;
        self.mirror.create_dir(&layout.staging_dir(execution_id))?;
        Ok(layout.exec_dir(execution_id))
    }

    /// Stage `content` under the execution's staging directory.
    ///
    /// The artifact id comes from the execution's checkpoint definition. A
    /// previously staged artifact with the same id is overwritten.
    pub fn stage(
        &self,
        execution_id: &str,
        name: &str,
        content: &[u8],
        format: ArtifactFormat,
    ) -> Result<Artifact> {
        let (execution, snapshot) = self.store.read(|c| {
            Ok((
                store::get_execution(c, execution_id)?,
                store::execution_snapshot(c, execution_id)?,
            ))
        })?;
        let artifact_id = snapshot.artifact_id_for(name);
        self.stage_with_id(&execution, &artifact_id, name, content, format)
    }

    /// Stage with an explicit artifact id.
    pub fn stage_with_id(
        &self,
        execution: &CheckpointExecution,
        artifact_id: &str,
        name: &str,
        content: &[u8],
        format: ArtifactFormat,
    ) -> Result<Artifact> {
        if matches!(
            execution.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed
        ) {
            return Err(GatehouseError::conflict(format!(
                "cannot stage artifacts for execution {} in status {}",
                execution.id, execution.status
            )));
        }
        if content.len() as u64 > self.max_artifact_bytes {
            return Err(GatehouseError::invalid_field(
                name,
                format!(
                    "artifact is {} bytes, limit is {}",
                    content.len(),
                    self.max_artifact_bytes
                ),
            ));
        }

        let layout = self.mirror.layout();
        let abs = layout.staged_artifact_path(&execution.id, name, artifact_id, format);
        self.mirror.write_file(&abs, content)?;

        let now = Utc::now();
        let artifact = Artifact {
            id: artifact_id.to_string(),
            execution_id: execution.id.clone(),
            run_id: execution.run_id.clone(),
            name: name.to_string(),
            format,
            size_bytes: content.len() as i64,
            checksum: sha256_hex(content),
            staged_path: layout.relative(&abs),
            promoted_path: None,
            promoted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .write(|tx| store::upsert_staged_artifact(tx, &artifact, content))?;

        debug!(
            execution_id = %execution.id,
            artifact_id,
            bytes = content.len(),
            "staged artifact"
        );
        Ok(artifact)
    }

    /// Drop staged artifacts of `execution` whose ids are not in `keep`.
    ///
    /// A retry or revision replaces the previous pass's output as a whole.
    pub fn retain_staged(&self, execution: &CheckpointExecution, keep: &[String]) -> Result<()> {
        let stale: Vec<Artifact> = self
            .list(&execution.id)?
            .into_iter()
            .filter(|a| !a.is_promoted() && !keep.contains(&a.id))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        self.store.write(|tx| {
            for artifact in &stale {
                store::delete_staged_artifact(tx, &execution.id, &artifact.id)?;
            }
            Ok(())
        })?;
        let layout = self.mirror.layout();
        for artifact in &stale {
            self.mirror.remove_file(&layout.resolve(&artifact.staged_path))?;
        }
        debug!(
            execution_id = %execution.id,
            dropped = stale.len(),
            "dropped stale staged artifacts"
        );
        Ok(())
    }

    /// Copy every unpromoted artifact of `execution` into its permanent path.
    ///
    /// Nothing is recorded in the store. On any failure the files copied so
    /// far are removed and the error is returned.
    pub fn prepare_promotion(&self, execution: &CheckpointExecution) -> Result<PendingPromotion> {
        let (run, artifacts) = self.store.read(|c| {
            Ok((
                store::get_run(c, &execution.run_id)?,
                store::list_artifacts(c, &execution.id)?,
            ))
        })?;

        let layout = self.mirror.layout();
        let mut files: Vec<PromotedFile> = Vec::new();

        for artifact in artifacts.iter().filter(|a| !a.is_promoted()) {
            let dest = layout.promoted_artifact_path(
                run.run_version,
                execution.checkpoint_position,
                &execution.checkpoint_name,
                &artifact.name,
                &artifact.id,
                artifact.format,
            );
            let copied = self
                .copy_verified(artifact, &dest)
                .map(|(size, checksum)| PromotedFile {
                    artifact_id: artifact.id.clone(),
                    path: layout.relative(&dest),
                    size_bytes: size,
                    checksum,
                });
            match copied {
                Ok(file) => files.push(file),
                Err(e) => {
                    // The failed destination may hold a partial copy.
                    let failed = layout.relative(&dest);
                    remove_copies(
                        self.mirror.as_ref(),
                        files.iter().map(|f| &f.path).chain(std::iter::once(&failed)),
                    );
                    return Err(e);
                }
            }
        }

        Ok(PendingPromotion {
            execution_id: execution.id.clone(),
            files,
            at: Utc::now(),
        })
    }

    fn copy_verified(&self, artifact: &Artifact, dest: &std::path::Path) -> Result<(i64, String)> {
        let src = self.mirror.layout().resolve(&artifact.staged_path);
        self.mirror.copy_file(&src, dest)?;
        let bytes = self.mirror.read_file(dest)?;
        let checksum = sha256_hex(&bytes);
        if checksum != artifact.checksum {
            return Err(GatehouseError::ConsistencyDrift(format!(
                "staged file for artifact {} does not match its recorded checksum",
                artifact.id
            )));
        }
        Ok((bytes.len() as i64, checksum))
    }

    /// Promote every staged artifact of an execution in one step.
    pub fn promote(&self, execution_id: &str) -> Result<Vec<Artifact>> {
        let execution = self.store.read(|c| store::get_execution(c, execution_id))?;
        let pending = self.prepare_promotion(&execution)?;
        if let Err(e) = self.store.write(|tx| pending.record(tx)) {
            pending.discard(self.mirror.as_ref());
            return Err(e);
        }
        info!(
            execution_id,
            artifacts = pending.files.len(),
            "promoted artifacts"
        );
        self.list(execution_id)
    }

    /// Remove an execution's temp workspace.
    ///
    /// Callers invoke this only after promotion and once the next execution
    /// exists or the run has completed.
    pub fn delete_temp(&self, execution_id: &str) -> Result<()> {
        let dir = self.mirror.layout().exec_dir(execution_id);
        self.mirror.remove_tree(&dir)?;
        debug!(execution_id, "deleted temp workspace");
        Ok(())
    }

    pub fn list(&self, execution_id: &str) -> Result<Vec<Artifact>> {
        self.store.read(|c| store::list_artifacts(c, execution_id))
    }

    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<Artifact>> {
        self.store.read(|c| store::list_run_artifacts(c, run_id))
    }
}
