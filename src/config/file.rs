//! TOML configuration file loading
//!
//! Reads the `[plugins]` table of `~/.config/omni/beacon/config.toml`.
//! All fields are optional; the file overlays the built-in defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
///
/// Only the sections the plugin host cares about are declared; other
/// gateway sections in the same file are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct BeaconConfigFile {
    /// Plugin host configuration
    #[serde(default)]
    pub plugins: PluginsFileConfig,
}

/// Plugin host configuration
#[derive(Debug, Default, Deserialize)]
pub struct PluginsFileConfig {
    /// Directory containing plugin executables
    pub dir: Option<String>,

    /// Writable directory for plugin-owned state
    pub sandbox_dir: Option<String>,

    /// Unix socket path plugins connect to
    pub socket: Option<String>,

    /// Graceful stop deadline in milliseconds
    pub stop_timeout_ms: Option<u64>,

    /// Time a new connection has to register, in milliseconds
    pub handshake_timeout_ms: Option<u64>,

    /// Deadline for forwarded plugin calls, in milliseconds
    pub request_timeout_ms: Option<u64>,

    /// Permission bits applied to the plugin directory (e.g. `0o555`)
    pub dir_mode: Option<u32>,

    /// Skip permission hardening of the plugin directory
    pub skip_dir_mode: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `BeaconConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> BeaconConfigFile {
    let Some(path) = config_file_path() else {
        return BeaconConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load the TOML config file from an explicit path
///
/// A missing file yields defaults silently; an unreadable or invalid one
/// yields defaults with a warning.
pub fn load_config_file_from(path: &Path) -> BeaconConfigFile {
    if !path.exists() {
        return BeaconConfigFile::default();
    }

    match parse_config_file(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            BeaconConfigFile::default()
        }
    }
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn parse_config_file(path: &Path) -> Result<BeaconConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/omni/beacon/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("config.toml")
    })
}
