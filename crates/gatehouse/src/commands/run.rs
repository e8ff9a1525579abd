//! Run command - create, start, pause and inspect runs.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::Style;

use super::{Context, done, heading, print_execution_line, print_run_line, print_summary};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(subcommand)]
    pub command: RunCommand,
}

/// Runs are addressed by id, `v{N}` or bare version number.
#[derive(Subcommand, Debug)]
pub enum RunCommand {
    /// Create the next run version
    Create {
        /// Build on this run instead of the latest valid one
        #[arg(long)]
        extends: Option<String>,
    },

    /// Start a created run
    Start { run: String },

    /// Stop new checkpoints from starting
    Pause { run: String },

    /// Continue a paused run
    Resume { run: String },

    /// Show a run and its executions
    Show { run: String },

    /// List every run of the pipeline
    List,
}

pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;

    match args.command {
        RunCommand::Create { extends } => {
            let base = match extends {
                Some(reference) => Some(engine.find_run(&reference)?.id),
                None => None,
            };
            let run = engine.create_run(base.as_deref()).await?;
            ctx.emit(&run, || {
                done(format!("Created run v{}", run.run_version));
                if let Some(version) = run.extends_from_run_version {
                    println!("  extends v{version}");
                }
                println!("  {}", Style::new().dim().apply_to(&run.id));
            })
        }
        RunCommand::Start { run } => {
            let id = engine.find_run(&run)?.id;
            let summary = engine.start_run(&id).await?;
            ctx.emit(&summary, || {
                done(format!("Started run v{}", summary.run.run_version));
                print_summary(&summary);
            })
        }
        RunCommand::Pause { run } => {
            let id = engine.find_run(&run)?.id;
            let paused = engine.pause_run(&id).await?;
            ctx.emit(&paused, || done(format!("Paused run v{}", paused.run_version)))
        }
        RunCommand::Resume { run } => {
            let id = engine.find_run(&run)?.id;
            let summary = engine.resume_run(&id).await?;
            ctx.emit(&summary, || {
                done(format!("Resumed run v{}", summary.run.run_version));
                print_summary(&summary);
            })
        }
        RunCommand::Show { run } => {
            let id = engine.find_run(&run)?.id;
            let summary = engine.get_run(&id)?;
            let executions = engine.list_executions(&id)?;
            let value = serde_json::json!({ "summary": summary, "executions": executions });
            ctx.emit(&value, || {
                print_summary(&summary);
                println!();
                for execution in &executions {
                    print_execution_line(execution);
                }
            })
        }
        RunCommand::List => {
            let runs = engine.list_runs()?;
            ctx.emit(&runs, || {
                heading(&format!("Runs of {}", engine.pipeline_id()));
                if runs.is_empty() {
                    println!("{}", Style::new().dim().apply_to("No runs yet"));
                }
                for run in &runs {
                    print_run_line(run);
                }
            })
        }
    }
}
