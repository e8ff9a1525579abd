//! Exec command - act on a single checkpoint execution.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{Args, Subcommand};
use console::{Style, style};
use gatehouse_core::types::LogLevel;
use gatehouse_core::{ArtifactFormat, CheckpointExecution, ProducedArtifact};
use serde_json::{Map, Value};

use super::{Context, done, heading, print_execution};

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(subcommand)]
    pub command: ExecCommand,
}

#[derive(Subcommand, Debug)]
pub enum ExecCommand {
    /// Show an execution with its artifacts and interactions
    Show { id: String },

    /// Let a gated execution start
    ApproveStart { id: String },

    /// Submit form data for a human checkpoint
    Submit {
        id: String,

        /// Whole form as a JSON object
        #[arg(long, conflicts_with = "fields")]
        data: Option<String>,

        /// One field as key=value (repeatable)
        #[arg(short = 'f', long = "field")]
        fields: Vec<String>,
    },

    /// Approve a finished execution and promote its artifacts
    Approve { id: String },

    /// Send a finished execution back with feedback
    Revise { id: String, feedback: String },

    /// Report externally executed work as finished
    Complete {
        id: String,

        /// Produced file as name=path or just path (repeatable)
        #[arg(short, long = "artifact")]
        artifacts: Vec<String>,
    },

    /// Report externally executed work as failed
    Fail { id: String, error: String },

    /// Show the execution's audit log
    Logs { id: String },
}

pub async fn run(args: ExecArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;

    match args.command {
        ExecCommand::Show { id } => {
            let execution = engine.get_execution(&id)?;
            let artifacts = engine.list_artifacts(&id)?;
            let interactions = engine.interactions(&id)?;
            let value = serde_json::json!({
                "execution": execution,
                "artifacts": artifacts,
                "interactions": interactions,
            });
            ctx.emit(&value, || {
                print_execution(&execution);
                if !artifacts.is_empty() {
                    println!();
                    super::artifacts::print_artifacts(&artifacts);
                }
                if !interactions.is_empty() {
                    println!();
                    for interaction in &interactions {
                        println!(
                            "  {} {}",
                            Style::new().dim().apply_to(interaction.created_at.format("%H:%M:%S")),
                            interaction.kind
                        );
                        if let Some(feedback) = &interaction.feedback {
                            println!("      {feedback}");
                        }
                    }
                }
            })
        }
        ExecCommand::ApproveStart { id } => {
            let execution = engine.approve_start(&id).await?;
            report(ctx, &execution, "Approved start of")
        }
        ExecCommand::Submit { id, data, fields } => {
            let form = match data {
                Some(json) => serde_json::from_str(&json).context("--data is not valid JSON")?,
                None => parse_fields(&fields)?,
            };
            let execution = engine.submit_form_data(&id, form).await?;
            report(ctx, &execution, "Submitted form for")
        }
        ExecCommand::Approve { id } => {
            let execution = engine.approve_complete(&id).await?;
            report(ctx, &execution, "Approved")
        }
        ExecCommand::Revise { id, feedback } => {
            let execution = engine.request_revision(&id, &feedback).await?;
            report(ctx, &execution, "Requested revision of")
        }
        ExecCommand::Complete { id, artifacts } => {
            let produced = artifacts
                .iter()
                .map(|spec| read_artifact(spec))
                .collect::<Result<Vec<_>>>()?;
            let execution = engine.report_success(&id, produced).await?;
            report(ctx, &execution, "Recorded output of")
        }
        ExecCommand::Fail { id, error } => {
            let execution = engine.report_failure(&id, &error).await?;
            report(ctx, &execution, "Recorded failure of")
        }
        ExecCommand::Logs { id } => {
            let logs = engine.execution_logs(&id)?;
            ctx.emit(&logs, || {
                heading("Execution log");
                for line in &logs {
                    let level = match line.level {
                        LogLevel::Error => style(line.level.as_str()).red(),
                        LogLevel::Warning => style(line.level.as_str()).yellow(),
                        LogLevel::Info => style(line.level.as_str()).dim(),
                    };
                    println!(
                        "{} {:<8} {}",
                        Style::new().dim().apply_to(line.created_at.format("%Y-%m-%d %H:%M:%S")),
                        level,
                        line.message
                    );
                }
            })
        }
    }
}

fn report(ctx: &Context, execution: &CheckpointExecution, verb: &str) -> Result<()> {
    ctx.emit(execution, || {
        done(format!("{verb} {}", execution.checkpoint_name));
        print_execution(execution);
    })
}

/// `key=value` pairs into a JSON object of strings.
fn parse_fields(fields: &[String]) -> Result<Value> {
    let mut form = Map::new();
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| anyhow!("field '{field}' is not key=value"))?;
        form.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(form))
}

/// `name=path` or `path`; the format comes from the file extension.
fn read_artifact(spec: &str) -> Result<ProducedArtifact> {
    let (name, path) = match spec.split_once('=') {
        Some((name, path)) => (name.to_string(), PathBuf::from(path)),
        None => {
            let path = PathBuf::from(spec);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow!("cannot name artifact from '{spec}'"))?
                .to_string();
            (stem, path)
        }
    };
    let format = format_of(&path)?;
    let content =
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ProducedArtifact {
        name,
        format,
        content,
    })
}

fn format_of(path: &Path) -> Result<ArtifactFormat> {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        bail!("{} has no extension to take the format from", path.display());
    };
    ArtifactFormat::parse(&ext.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("unsupported artifact format '.{ext}'"))
}
