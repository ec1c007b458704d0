//! Configuration file loading.
//!
//! Settings come from three places with decreasing precedence: command
//! line flags, an optional TOML configuration file, and built-in
//! defaults. This module owns the file format; the merge happens in
//! `main`.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub demux: DemuxSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[demux]` section.
#[derive(Debug, Default, Deserialize)]
pub struct DemuxSection {
    /// Directory where reconstructed carousel objects are written.
    pub tmpdir: Option<PathBuf>,
    /// Identity cache capacity.
    pub cache_capacity: Option<usize>,
    /// Default carousel block size when no DII has been seen.
    pub block_size: Option<u16>,
    /// PIDs carrying DSM-CC sections.
    #[serde(default)]
    pub carousel_pids: Vec<u16>,
}

/// `[logging]` section.
#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    pub log_dir: Option<PathBuf>,
    pub retention_days: Option<u64>,
}

/// Load the configuration file, or defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    info!("Loading configuration from {:?}", path);
    let content = fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    Ok(config)
}
