//! Gatehouse - gated, versioned pipeline runs.
//!
//! Main entry point for the Gatehouse CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::Style;
use gatehouse_core::{CommandStatus, GatehouseError, Layout};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{artifacts, check, config, exec, init, rollback, run};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Gatehouse - gated, versioned pipeline runs
#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Pipeline root directory (default: <pipelines_root>/<pipeline>)
    #[arg(long, global = true, env = "GATEHOUSE_ROOT")]
    pub root: Option<PathBuf>,

    /// Pipeline id (default: the only pipeline defined under the root)
    #[arg(long, global = true, env = "GATEHOUSE_PIPELINE")]
    pub pipeline: Option<String>,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a pipeline root from a definition file
    Init(init::InitArgs),

    /// Create, start, pause and inspect runs
    Run(run::RunArgs),

    /// Act on a single checkpoint execution
    Exec(exec::ExecArgs),

    /// List an execution's artifacts
    Artifacts(artifacts::ArtifactsArgs),

    /// Roll back checkpoints or whole runs
    Rollback(rollback::RollbackArgs),

    /// Compare the file mirror with the database
    Check(check::CheckArgs),

    /// Remove errored workspaces past the retention window
    Prune(check::PruneArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match gatehouse_config::load_config(None) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{} {}", Style::new().red().apply_to("Error:"), e);
            return ExitCode::FAILURE;
        }
    };

    let ctx = commands::Context {
        root: cli.root,
        pipeline: cli.pipeline,
        json_output: cli.json,
        verbose: cli.verbose,
        loaded,
    };

    // Only log to a root that exists, or that `init` is about to create.
    let log_dir = match &cli.command {
        Commands::Config(_) => None,
        command => ctx
            .pipeline_root()
            .ok()
            .filter(|root| root.is_dir() || matches!(command, Commands::Init(_)))
            .map(|root| Layout::new(root).logs_dir()),
    };
    let _guard = init_logging(&ctx, log_dir);
    for warning in &ctx.loaded.warnings {
        tracing::warn!("{warning}");
    }

    let result = match cli.command {
        Commands::Init(args) => init::run(args, &ctx).await,
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Exec(args) => exec::run(args, &ctx).await,
        Commands::Artifacts(args) => artifacts::run(args, &ctx).await,
        Commands::Rollback(args) => rollback::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
        Commands::Prune(args) => check::prune(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e, ctx.json_output),
    }
}

/// Console layer on stderr plus, when a pipeline root is known, a daily JSON
/// file under its logs directory.
fn init_logging(ctx: &commands::Context, log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let logging = ctx.loaded.config.logging();
    let console_filter = if ctx.verbose {
        EnvFilter::new("gatehouse=debug,gatehouse_core=debug,gatehouse_config=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "gatehouse={0},gatehouse_core={0},warn",
                logging.level
            ))
        })
    };
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let log_dir = log_dir
        .filter(|_| logging.json_file)
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());
    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(console).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::daily(&dir, "system.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(console)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "gatehouse=trace,gatehouse_core=debug,gatehouse_config=debug,info",
                )),
        )
        .init();
    Some(guard)
}

/// Print a failed command with its status class and pick the exit code.
fn report(error: &anyhow::Error, json: bool) -> ExitCode {
    let status = error
        .downcast_ref::<GatehouseError>()
        .map(GatehouseError::status)
        .unwrap_or(CommandStatus::Internal);

    if json {
        let body = serde_json::json!({ "status": status, "error": format!("{error:#}") });
        println!("{body}");
    } else {
        let label = serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        eprintln!(
            "{} {} {:#}",
            Style::new().red().bold().apply_to("Error:"),
            Style::new().dim().apply_to(format!("[{label}]")),
            error
        );
    }

    ExitCode::from(match status {
        CommandStatus::Success => 0,
        CommandStatus::Internal => 1,
        CommandStatus::ValidationError => 2,
        CommandStatus::Conflict => 3,
        CommandStatus::NotFound => 4,
    })
}
