//! Artifacts command - list what an execution produced.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use gatehouse_core::Artifact;

use super::{Context, heading};

#[derive(Args, Debug)]
pub struct ArtifactsArgs {
    /// Execution id
    pub execution_id: String,
}

pub async fn run(args: ArtifactsArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;
    let artifacts = engine.list_artifacts(&args.execution_id)?;
    ctx.emit(&artifacts, || {
        heading("Artifacts");
        if artifacts.is_empty() {
            println!("{}", Style::new().dim().apply_to("No artifacts"));
        } else {
            print_artifacts(&artifacts);
        }
    })
}

pub fn print_artifacts(artifacts: &[Artifact]) {
    let dim = Style::new().dim();
    for artifact in artifacts {
        let (state, path) = match &artifact.promoted_path {
            Some(path) => (style("promoted").green(), path),
            None => (style("staged").yellow(), &artifact.staged_path),
        };
        println!(
            "  {:<20} {:<6} {:>9} {:<10} {}",
            artifact.name,
            artifact.format.as_str(),
            human_size(artifact.size_bytes),
            state,
            dim.apply_to(path.display())
        );
    }
}

fn human_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(12), "12 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
