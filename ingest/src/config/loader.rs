// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the TOML file, fills missing sections with defaults and validates
//! the result before anything is opened.

use crate::config::model::{Config, ConfigError};
use std::{fs, path::Path};

/// Load, parse and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    log::debug!("Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = parse(&txt)?;
    log::info!("Loaded config from {:?}", path);
    Ok(cfg)
}

/// Parse and validate configuration text.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(txt)?;
    cfg.validate()?;
    Ok(cfg)
}
