//! Configuration types.
//!
//! Every section is optional in the file; accessors fall back to defaults.
//! Layers replace whole sections, so a project file with `[engine]` wins over
//! the user file's `[engine]` entirely.

use std::path::PathBuf;
use std::time::Duration;

use gatehouse_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatehouseConfig {
    pub engine: Option<EngineSection>,
    pub logging: Option<LoggingSection>,
    pub retention: Option<RetentionSection>,
}

impl GatehouseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: GatehouseConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
        if other.retention.is_some() {
            self.retention = other.retention;
        }
    }

    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    pub fn retention(&self) -> RetentionSection {
        self.retention.clone().unwrap_or_default()
    }

    /// The library-side settings for an orchestrator.
    pub fn engine_config(&self) -> EngineConfig {
        let engine = self.engine();
        EngineConfig {
            retry_delay: Duration::from_secs(engine.retry_delay_secs),
            check_on_startup: engine.check_on_startup,
            max_artifact_bytes: engine.max_artifact_size_mb.saturating_mul(1024 * 1024),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(engine) = &self.engine
            && engine.max_artifact_size_mb == 0
        {
            return Err(ConfigError::Invalid {
                field: "engine.max_artifact_size_mb".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Directory holding one root per pipeline.
    pub pipelines_root: PathBuf,
    pub retry_delay_secs: u64,
    pub check_on_startup: bool,
    pub max_artifact_size_mb: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            pipelines_root: PathBuf::from("./pipelines"),
            retry_delay_secs: 5,
            check_on_startup: true,
            max_artifact_size_mb: 100,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Also write JSON logs under the pipeline's system directory.
    pub json_file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_file: true,
        }
    }
}

/// `[retention]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    /// Days an errored workspace copy is kept before `prune` removes it.
    pub error_retention_days: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            error_retention_days: 90,
        }
    }
}
