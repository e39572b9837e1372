//! Configuration system for the stowaway session manager.
//!
//! Provides TOML-based configuration with:
//! - A `[persistence]` section for swap, backup and capacity thresholds
//! - A `[store]` section locating the file-backed session store
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{ConfigSource, LoadedConfig, load_config_file, load_config_with_options};
pub use error::{ConfigError, Result};
pub use types::*;
