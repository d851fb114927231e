//! Configuration system for conduit.
//!
//! Provides TOML-based configuration with:
//! - MCP server entries (`[[servers]]`) for stdio and unix socket transports
//! - Client timeouts (`[timeouts]`)
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, log_dir, save_config,
    xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
