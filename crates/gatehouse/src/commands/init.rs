//! Init command - create a pipeline root from a definition file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;
use console::Style;
use gatehouse_core::{
    DefinitionCatalog, DefinitionFile, DeferredCapability, Layout, LocalMirror, Mirror,
    Orchestrator,
};

use super::{Context, done};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Pipeline definition (TOML with a [pipeline] table and [[checkpoints]])
    pub definition: PathBuf,
}

pub async fn run(args: InitArgs, ctx: &Context) -> Result<()> {
    let file = DefinitionFile::from_file(&args.definition)?;
    file.validate()?;
    let pipeline_id = file.pipeline.id.clone();
    if let Some(selected) = &ctx.pipeline
        && selected != &pipeline_id
    {
        bail!("definition is for pipeline '{pipeline_id}', not '{selected}'");
    }

    let root = match &ctx.root {
        Some(root) => root.clone(),
        None => ctx.loaded.config.engine().pipelines_root.join(&pipeline_id),
    };
    let layout = Layout::new(&root);
    LocalMirror::new(layout.clone()).initialize()?;

    let target = layout.definitions_dir().join(format!("{pipeline_id}.toml"));
    std::fs::copy(&args.definition, &target)?;

    let checkpoints = file.checkpoints.len();
    let catalog = DefinitionCatalog::new();
    catalog.insert_file(file)?;
    Orchestrator::open(
        &root,
        &pipeline_id,
        Arc::new(catalog),
        Arc::new(DeferredCapability),
        ctx.loaded.config.engine_config(),
    )?;
    tracing::info!(pipeline_id, root = %root.display(), "pipeline initialised");

    let value = serde_json::json!({
        "pipeline_id": pipeline_id,
        "root": root,
        "checkpoints": checkpoints,
    });
    ctx.emit(&value, || {
        done(format!("Initialized pipeline '{pipeline_id}' ({checkpoints} checkpoints)"));
        println!("  {}", Style::new().dim().apply_to(root.display()));
    })
}
