//! Check and prune commands - mirror maintenance.

use anyhow::Result;
use clap::Args;
use console::style;

use super::{Context, done};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Regenerate the mirror from the database when it drifted
    #[arg(long)]
    pub repair: bool,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Retention in days (default: [retention] error_retention_days)
    #[arg(long)]
    pub days: Option<u32>,
}

pub async fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;
    let report = engine.check_consistency(args.repair)?;
    ctx.emit(&report, || {
        if report.is_consistent() {
            done("Mirror matches the database");
            return;
        }
        println!(
            "{} {} drift(s)",
            style("!").yellow().bold(),
            report.drifts.len()
        );
        for drift in &report.drifts {
            println!("  {drift:?}");
        }
        if report.repaired {
            done("Mirror regenerated");
        } else {
            println!("  run with --repair to regenerate");
        }
    })
}

pub async fn prune(args: PruneArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;
    let days = args
        .days
        .unwrap_or(ctx.loaded.config.retention().error_retention_days);
    let removed = engine.prune_errored(days)?;
    let value = serde_json::json!({ "removed": removed, "retention_days": days });
    ctx.emit(&value, || {
        done(format!("Removed {removed} errored workspace(s) older than {days} days"))
    })
}
