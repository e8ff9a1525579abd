//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use gatehouse_config::{
    EngineSection, GatehouseConfig, LoggingSection, RetentionSection, save_config,
    user_config_dir, user_config_path,
};

use super::{Context, done};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Write a config file with every default spelled out
    Init {
        /// Create project-local config (./gatehouse.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show the user config file path
    Path,
}

pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Init { local } => cmd_init(local),
        ConfigCommand::Path => cmd_path(),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let config = &ctx.loaded.config;
    // Fill every section so the output shows what is in effect.
    let effective = GatehouseConfig {
        engine: Some(config.engine()),
        logging: Some(config.logging()),
        retention: Some(config.retention()),
    };
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&effective)?);
        return Ok(());
    }

    println!("# Gatehouse Configuration\n");
    let sources = ctx.loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)\n");
    } else {
        for path in sources {
            println!("# from {}", path.display());
        }
        println!();
    }
    print!("{}", effective.to_toml()?);
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    println!("Config file search order (later overrides earlier):\n");
    for source in &ctx.loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = ctx.loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'gatehouse config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }
    Ok(())
}

fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("gatehouse.toml")
    } else {
        user_config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("config.toml")
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    let config = GatehouseConfig {
        engine: Some(EngineSection::default()),
        logging: Some(LoggingSection::default()),
        retention: Some(RetentionSection::default()),
    };
    save_config(&config, &path)?;
    done(format!("Created config file: {}", path.display()));
    Ok(())
}

fn cmd_path() -> Result<()> {
    match user_config_path() {
        Some(path) => println!("{}", path.display()),
        None => eprintln!("Could not determine config directory"),
    }
    Ok(())
}
