//! Rollback command - archive and remove checkpoints or whole runs.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::{Style, style};
use gatehouse_core::RollbackEvent;

use super::{Context, done, heading, print_execution_line};

#[derive(Args, Debug)]
pub struct RollbackArgs {
    #[command(subcommand)]
    pub command: RollbackCommand,
}

#[derive(Subcommand, Debug)]
pub enum RollbackCommand {
    /// Remove every execution of a run after a position
    Checkpoint {
        run: String,
        /// Position of the completed checkpoint to keep
        position: i64,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Remove every run newer than the target run
    Run {
        /// Run the rollback is requested from
        source: String,
        /// Run to roll back to
        target: String,
        /// Position in the target run to keep up to
        position: i64,
        #[arg(long)]
        reason: Option<String>,
    },

    /// List past rollbacks, newest first
    History {
        #[arg(long)]
        run: Option<String>,
    },

    /// List the positions a run can be rolled back to
    Points { run: String },
}

pub async fn run(args: RollbackArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;

    match args.command {
        RollbackCommand::Checkpoint {
            run,
            position,
            reason,
        } => {
            let id = engine.find_run(&run)?.id;
            let event = engine
                .rollback_checkpoint(&id, position, reason.as_deref())
                .await?;
            ctx.emit(&event, || print_rollback(&event))
        }
        RollbackCommand::Run {
            source,
            target,
            position,
            reason,
        } => {
            let source = engine.find_run(&source)?.id;
            let target = engine.find_run(&target)?.id;
            let event = engine
                .rollback_run(&source, &target, position, reason.as_deref())
                .await?;
            ctx.emit(&event, || print_rollback(&event))
        }
        RollbackCommand::History { run } => {
            let run_id = match run {
                Some(reference) => Some(engine.find_run(&reference)?.id),
                None => None,
            };
            let events = engine.rollback_history(run_id.as_deref())?;
            ctx.emit(&events, || {
                heading("Rollback history");
                if events.is_empty() {
                    println!("{}", Style::new().dim().apply_to("No rollbacks"));
                }
                for event in &events {
                    println!(
                        "{} {:<16} v{} -> {} [{}] {}",
                        Style::new().dim().apply_to(event.created_at.format("%Y-%m-%d %H:%M:%S")),
                        event.kind.as_str(),
                        event.source_run_version,
                        event.target_checkpoint_id,
                        event.target_position,
                        event.reason.as_deref().unwrap_or("")
                    );
                }
            })
        }
        RollbackCommand::Points { run } => {
            let id = engine.find_run(&run)?.id;
            let points = engine.rollback_points(&id)?;
            ctx.emit(&points, || {
                heading("Rollback points");
                for execution in &points {
                    print_execution_line(execution);
                }
            })
        }
    }
}

fn print_rollback(event: &RollbackEvent) {
    done(format!(
        "Rolled back to {} [{}]",
        event.target_checkpoint_id, event.target_position
    ));
    let items = &event.items;
    if !items.deleted_runs.is_empty() {
        println!("  {} runs removed", style(items.deleted_runs.len()).bold());
    }
    println!(
        "  {} executions, {} artifacts archived",
        style(items.deleted_executions.len()).bold(),
        style(items.archived_artifacts.len()).bold()
    );
    println!(
        "  {}",
        Style::new().dim().apply_to(event.archive_location.display())
    );
}
