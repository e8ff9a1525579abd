//! Configuration for Gatehouse.
//!
//! TOML files layered in order (later overrides earlier, per section):
//! - `$GATEHOUSE_CONFIG_DIR/config.toml` or the platform config dir
//! - `./gatehouse.toml` (project-local)
//! - CLI flags (applied by the binary)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
