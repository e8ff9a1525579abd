//! CLI command handlers.

pub mod artifacts;
pub mod check;
pub mod config;
pub mod exec;
pub mod init;
pub mod rollback;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use console::{Style, style};
use gatehouse_config::LoadedConfig;
use gatehouse_core::{
    CheckpointExecution, DefinitionCatalog, DeferredCapability, ExecutionStatus, Layout,
    Orchestrator, PipelineRun, RunStatus, RunSummary,
};
use serde::Serialize;

/// Shared context for all commands.
#[derive(Debug)]
pub struct Context {
    /// Explicit pipeline root.
    pub root: Option<PathBuf>,
    /// Explicit pipeline id.
    pub pipeline: Option<String>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    pub loaded: LoadedConfig,
}

impl Context {
    /// `--root`, else `<pipelines_root>/<pipeline>`.
    pub fn pipeline_root(&self) -> Result<PathBuf> {
        match (&self.root, &self.pipeline) {
            (Some(root), _) => Ok(root.clone()),
            (None, Some(pipeline)) => Ok(self
                .loaded
                .config
                .engine()
                .pipelines_root
                .join(pipeline)),
            (None, None) => bail!("no pipeline selected: pass --pipeline or --root"),
        }
    }

    /// Open the orchestrator for the selected pipeline root.
    ///
    /// Agentic and script checkpoints are deferred; their results come back
    /// through `exec complete` and `exec fail`.
    pub fn open(&self) -> Result<Orchestrator> {
        let root = self.pipeline_root()?;
        if !root.is_dir() {
            bail!(
                "no pipeline root at {} (run `gatehouse init` first)",
                root.display()
            );
        }
        let layout = Layout::new(&root);
        let catalog = DefinitionCatalog::new();
        catalog.load_dir(&layout.definitions_dir())?;

        let pipeline_id = match &self.pipeline {
            Some(id) => id.clone(),
            None => {
                let ids = catalog.pipeline_ids();
                match ids.as_slice() {
                    [only] => only.clone(),
                    [] => bail!("no pipeline definitions under {}", root.display()),
                    _ => bail!("several pipelines defined ({}); pass --pipeline", ids.join(", ")),
                }
            }
        };

        let engine = Orchestrator::open(
            &root,
            &pipeline_id,
            Arc::new(catalog),
            Arc::new(DeferredCapability),
            self.loaded.config.engine_config(),
        )?;
        Ok(engine)
    }

    /// Print `value` as JSON, or run `human` for styled output.
    pub fn emit<T: Serialize + ?Sized>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json_output {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

/// Check mark plus message, the success line for mutating commands.
pub fn done(message: impl std::fmt::Display) {
    println!("{} {}", Style::new().green().apply_to("✓"), message);
}

pub fn heading(title: &str) {
    println!("{}", style(title).bold());
    println!("{}", Style::new().dim().apply_to("─".repeat(50)));
}

pub fn run_status(status: RunStatus) -> String {
    let styled = match status {
        RunStatus::Completed => style(status.as_str()).green(),
        RunStatus::Failed => style(status.as_str()).red(),
        RunStatus::Paused => style(status.as_str()).yellow(),
        _ => style(status.as_str()).cyan(),
    };
    styled.to_string()
}

pub fn execution_status(status: ExecutionStatus) -> String {
    let styled = match status {
        ExecutionStatus::Completed => style(status.as_str()).green(),
        ExecutionStatus::Failed => style(status.as_str()).red(),
        ExecutionStatus::WaitingApprovalToStart | ExecutionStatus::WaitingApprovalToComplete => {
            style(status.as_str()).yellow()
        }
        _ => style(status.as_str()).cyan(),
    };
    styled.to_string()
}

/// One line per run.
pub fn print_run_line(run: &PipelineRun) {
    let dim = Style::new().dim();
    println!(
        "{:<5} {:<22} {} {}",
        format!("v{}", run.run_version),
        run_status(run.status),
        dim.apply_to(&run.id),
        dim.apply_to(run.created_at.format("%Y-%m-%d %H:%M:%S")),
    );
}

pub fn print_execution_line(execution: &CheckpointExecution) {
    let dim = Style::new().dim();
    println!(
        "  [{}] {:<20} {:<30} {}",
        execution.checkpoint_position,
        execution.checkpoint_name,
        execution_status(execution.status),
        dim.apply_to(&execution.id),
    );
}

pub fn print_summary(summary: &RunSummary) {
    let dim = Style::new().dim();
    let run = &summary.run;
    heading(&format!("Run v{}", run.run_version));
    println!("{:<14} {}", dim.apply_to("id"), run.id);
    println!("{:<14} {}", dim.apply_to("status"), run_status(run.status));
    println!(
        "{:<14} {}/{}",
        dim.apply_to("progress"),
        summary.completed_checkpoints,
        summary.total_checkpoints
    );
    if let Some(version) = run.extends_from_run_version {
        println!("{:<14} v{}", dim.apply_to("extends"), version);
    }
    if let Some(current) = &summary.current_execution {
        println!(
            "{:<14} {} ({}) {}",
            dim.apply_to("current"),
            current.checkpoint_name,
            execution_status(current.status),
            dim.apply_to(&current.id)
        );
    }
}

pub fn print_execution(execution: &CheckpointExecution) {
    let dim = Style::new().dim();
    heading(&format!(
        "Checkpoint {} [{}]",
        execution.checkpoint_name, execution.checkpoint_position
    ));
    println!("{:<14} {}", dim.apply_to("id"), execution.id);
    println!("{:<14} {}", dim.apply_to("status"), execution_status(execution.status));
    println!("{:<14} {}", dim.apply_to("attempt"), execution.attempt_number);
    println!("{:<14} {}", dim.apply_to("revision"), execution.revision_iteration);
    println!(
        "{:<14} {}",
        dim.apply_to("workspace"),
        execution.temp_workspace_path.display()
    );
    if let Some(error) = &execution.last_error {
        println!("{:<14} {}", dim.apply_to("last error"), style(error).red());
    }
}
