//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

use gatehouse_core::definitions::{AgenticConfig, FormArtifact, HumanOnlyConfig, InputField};
use gatehouse_core::{
    CheckpointDefinition, DefinitionCatalog, DefinitionFile, EngineConfig, ExecutionCapability,
    ExecutionMode, ExecutionReply, ExecutionRequest, Layout, LocalMirror, Mirror, Orchestrator,
    Pipeline, ProducedArtifact, RunSummary, Store,
};

pub const PIPELINE: &str = "blog";

/// What the scripted capability does for one call.
pub enum Scripted {
    Produce(Vec<ProducedArtifact>),
    Fail(String),
    Defer,
    /// Never returns; only a timeout ends the call.
    Hang,
    /// Wait inside the executor until the gate opens, then produce.
    Park(Arc<Gate>),
}

/// Lets a test hold an executor call open.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once the executor is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.notify_one();
    }
}

/// Capability that replays a queue of outcomes and records every request.
#[derive(Default)]
pub struct ScriptedCapability {
    queue: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedCapability {
    pub fn new(outcomes: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: Scripted) {
        self.queue.lock().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ExecutionCapability for ScriptedCapability {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionReply> {
        let name = format!("{}_out", request.checkpoint.id);
        self.requests.lock().push(request);
        let next = self.queue.lock().pop_front();
        match next {
            Some(Scripted::Produce(artifacts)) => Ok(ExecutionReply::Produced(artifacts)),
            Some(Scripted::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Scripted::Defer) => Ok(ExecutionReply::Deferred),
            Some(Scripted::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Scripted::Park(gate)) => {
                gate.entered.notify_one();
                gate.release.notified().await;
                Ok(ExecutionReply::Produced(vec![ProducedArtifact::text(
                    &name,
                    gatehouse_core::ArtifactFormat::Md,
                    "after the gate",
                )]))
            }
            None => Ok(ExecutionReply::Produced(vec![ProducedArtifact::text(
                &name,
                gatehouse_core::ArtifactFormat::Md,
                "generated",
            )])),
        }
    }
}

/// Local mirror with switchable failures.
pub struct FaultyMirror {
    inner: LocalMirror,
    pub fail_copy_tree: AtomicBool,
    /// Report archived trees one byte short of their originals.
    pub short_archives: AtomicBool,
    /// Fail the nth `copy_file` call from now (1-based); 0 disables.
    pub fail_copy_file_at: AtomicUsize,
    copy_file_calls: AtomicUsize,
}

impl FaultyMirror {
    pub fn new(layout: Layout) -> Self {
        Self {
            inner: LocalMirror::new(layout),
            fail_copy_tree: AtomicBool::new(false),
            short_archives: AtomicBool::new(false),
            fail_copy_file_at: AtomicUsize::new(0),
            copy_file_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_nth_copy(&self, n: usize) {
        self.copy_file_calls.store(0, Ordering::SeqCst);
        self.fail_copy_file_at.store(n, Ordering::SeqCst);
    }
}

impl Mirror for FaultyMirror {
    fn layout(&self) -> &Layout {
        self.inner.layout()
    }
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir(path)
    }
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.inner.write_file(path, contents)
    }
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read_file(path)
    }
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let call = self.copy_file_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_copy_file_at.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected copy_file failure"));
        }
        self.inner.copy_file(from, to)
    }
    fn copy_tree(&self, from: &Path, to: &Path) -> io::Result<u64> {
        if self.fail_copy_tree.load(Ordering::SeqCst) {
            // Leave a partial copy behind, like a crash mid-copy would.
            self.inner.create_dir(to)?;
            return Err(io::Error::other("injected copy_tree failure"));
        }
        self.inner.copy_tree(from, to)
    }
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }
    fn remove_tree(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_tree(path)
    }
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
    fn file_size(&self, path: &Path) -> io::Result<u64> {
        self.inner.file_size(path)
    }
    fn tree_size(&self, path: &Path) -> u64 {
        let size = self.inner.tree_size(path);
        let archived = path.starts_with(self.inner.layout().archived_dir());
        if archived && self.short_archives.load(Ordering::SeqCst) {
            size.saturating_sub(1)
        } else {
            size
        }
    }
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.list_dir(path)
    }
    fn point_latest(&self, run_version: Option<i64>) -> io::Result<()> {
        self.inner.point_latest(run_version)
    }
    fn read_latest(&self) -> Option<i64> {
        self.inner.read_latest()
    }
}

/// A pipeline root in a temp dir with an orchestrator over it.
pub struct Harness {
    pub dir: TempDir,
    pub catalog: Arc<DefinitionCatalog>,
    pub capability: Arc<ScriptedCapability>,
    pub mirror: Arc<FaultyMirror>,
    pub engine: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(checkpoints: Vec<CheckpointDefinition>) -> Self {
        Self::build(checkpoints, true, Vec::new())
    }

    pub fn with_outcomes(checkpoints: Vec<CheckpointDefinition>, outcomes: Vec<Scripted>) -> Self {
        Self::build(checkpoints, true, outcomes)
    }

    pub fn build(
        checkpoints: Vec<CheckpointDefinition>,
        auto_advance: bool,
        outcomes: Vec<Scripted>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let mirror = Arc::new(FaultyMirror::new(layout.clone()));
        mirror.initialize().unwrap();
        let store = Arc::new(Store::open(&layout.db_path()).unwrap());

        let mut pipeline = Pipeline::new(
            PIPELINE,
            checkpoints.iter().map(|c| c.id.clone()).collect(),
        );
        pipeline.auto_advance = auto_advance;
        let catalog = Arc::new(DefinitionCatalog::new());
        catalog
            .insert_file(DefinitionFile {
                pipeline,
                checkpoints,
            })
            .unwrap();

        let capability = ScriptedCapability::new(outcomes);
        let engine = Arc::new(Orchestrator::from_parts(
            PIPELINE,
            store,
            mirror.clone(),
            catalog.clone(),
            capability.clone(),
            &EngineConfig::immediate(),
        ));
        Self {
            dir,
            catalog,
            capability,
            mirror,
            engine,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn mirror_latest(&self) -> Option<i64> {
        self.mirror.read_latest()
    }

    /// Create and start a run.
    pub async fn started_run(&self) -> RunSummary {
        let run = self.engine.create_run(None).await.unwrap();
        self.engine.start_run(&run.id).await.unwrap()
    }

    pub fn current_execution_id(&self, run_id: &str) -> String {
        self.engine
            .get_run(run_id)
            .unwrap()
            .current_execution
            .expect("run has a current execution")
            .id
    }

    /// Submit a minimal form for the run's current execution.
    pub async fn submit_current(&self, run_id: &str) -> String {
        let id = self.current_execution_id(run_id);
        self.engine
            .submit_form_data(&id, json!({"topic": "rust"}))
            .await
            .unwrap();
        id
    }

    /// Drive a fresh run of an all-human pipeline to completion.
    pub async fn completed_run(&self) -> RunSummary {
        let summary = self.started_run().await;
        let run_id = summary.run.id.clone();
        for _ in 0..summary.total_checkpoints {
            self.submit_current(&run_id).await;
        }
        self.engine.get_run(&run_id).unwrap()
    }
}

/// Human-only checkpoint that saves its form as a JSON artifact.
pub fn human(id: &str) -> CheckpointDefinition {
    let mut checkpoint = CheckpointDefinition::human(id);
    checkpoint.mode = ExecutionMode::HumanOnly(HumanOnlyConfig {
        instructions: format!("Fill in {id}"),
        input_fields: vec![InputField {
            name: "topic".into(),
            field_type: Default::default(),
            label: "Topic".into(),
            required: true,
        }],
        save_as_artifact: Some(FormArtifact {
            id: format!("{id}_form"),
            name: "form".into(),
            format: gatehouse_core::ArtifactFormat::Json,
        }),
    });
    checkpoint
}

pub fn agentic(id: &str) -> CheckpointDefinition {
    let mut checkpoint = CheckpointDefinition::human(id);
    checkpoint.mode = ExecutionMode::Agentic(AgenticConfig {
        prompt: format!("Produce {id}"),
        ..Default::default()
    });
    checkpoint
}

pub fn md(name: &str, body: &str) -> ProducedArtifact {
    ProducedArtifact::text(name, gatehouse_core::ArtifactFormat::Md, body)
}
