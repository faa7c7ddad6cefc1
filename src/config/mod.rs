//! Configuration management for the plugin host

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

use self::file::PluginsFileConfig;

/// Deadline for a plugin to acknowledge a graceful stop
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Time a fresh connection has to send its registration
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for forwarded plugin calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Plugin directory permissions: read-only, so plugins cannot modify their own directory
pub const DEFAULT_PLUGIN_DIR_MODE: u32 = 0o555;

/// Name of the sandbox directory created inside the plugin directory
pub const SANDBOX_DIR_NAME: &str = "plugindata";

/// Plugin supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory containing plugin executables
    pub plugin_dir: PathBuf,

    /// Writable directory for plugin-owned state
    pub sandbox_dir: PathBuf,

    /// Unix socket path plugins connect to
    pub socket_path: PathBuf,

    /// Graceful stop deadline, shared by all instances stopped in one call
    pub stop_timeout: Duration,

    /// Time a new connection has to register before it is dropped
    pub handshake_timeout: Duration,

    /// Deadline for forwarded plugin calls
    pub request_timeout: Duration,

    /// Permission bits applied to the plugin directory; `None` leaves them untouched
    pub plugin_dir_mode: Option<u32>,
}

impl SupervisorConfig {
    /// Create a configuration for an explicit plugin directory and socket
    ///
    /// The sandbox lives under the plugin directory and timeouts use defaults.
    #[must_use]
    pub fn new(plugin_dir: impl Into<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        let plugin_dir = plugin_dir.into();
        Self {
            sandbox_dir: plugin_dir.join(SANDBOX_DIR_NAME),
            plugin_dir,
            socket_path: socket_path.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            plugin_dir_mode: Some(DEFAULT_PLUGIN_DIR_MODE),
        }
    }

    /// Load configuration from the config file and environment
    ///
    /// Environment variables take precedence over the `[plugins]` table of
    /// the config file, which takes precedence over defaults.
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an invalid value
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file().plugins;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a file section and an environment lookup
    fn from_sources(
        fc: PluginsFileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let plugin_dir = env("BEACON_PLUGIN_DIR")
            .or(fc.dir)
            .map_or_else(default_plugin_dir, PathBuf::from);

        let sandbox_dir = env("BEACON_PLUGIN_SANDBOX_DIR")
            .or(fc.sandbox_dir)
            .map_or_else(|| plugin_dir.join(SANDBOX_DIR_NAME), PathBuf::from);

        let socket_path = env("BEACON_PLUGIN_SOCKET")
            .or(fc.socket)
            .map_or_else(default_socket_path, PathBuf::from);

        let stop_timeout = duration_setting(
            &env,
            "BEACON_PLUGIN_STOP_TIMEOUT_MS",
            fc.stop_timeout_ms,
            DEFAULT_STOP_TIMEOUT,
        )?;
        let handshake_timeout = duration_setting(
            &env,
            "BEACON_PLUGIN_HANDSHAKE_TIMEOUT_MS",
            fc.handshake_timeout_ms,
            DEFAULT_HANDSHAKE_TIMEOUT,
        )?;
        let request_timeout = duration_setting(
            &env,
            "BEACON_PLUGIN_REQUEST_TIMEOUT_MS",
            fc.request_timeout_ms,
            DEFAULT_REQUEST_TIMEOUT,
        )?;

        let plugin_dir_mode = if fc.skip_dir_mode.unwrap_or(false) {
            None
        } else {
            Some(fc.dir_mode.unwrap_or(DEFAULT_PLUGIN_DIR_MODE))
        };

        Ok(Self {
            plugin_dir,
            sandbox_dir,
            socket_path,
            stop_timeout,
            handshake_timeout,
            request_timeout,
            plugin_dir_mode,
        })
    }
}

/// Read a millisecond duration from the environment, falling back to the file value
fn duration_setting(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file_value: Option<u64>,
    default: Duration,
) -> Result<Duration> {
    let millis = match env(key) {
        Some(raw) => Some(
            raw.trim()
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("{key}: invalid milliseconds '{raw}': {e}")))?,
        ),
        None => file_value,
    };

    Ok(millis.map_or(default, Duration::from_millis))
}

/// Default plugin directory: `<data_dir>/omni/beacon/plugins`
#[must_use]
pub fn default_plugin_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".beacon/plugins"),
        |d| d.data_dir().join("omni").join("beacon").join("plugins"),
    )
}

/// Default socket address under the per-user runtime directory
///
/// Falls back to `~/.beacon/run` on platforms without a runtime directory.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    let Some(dirs) = directories::BaseDirs::new() else {
        return PathBuf::from(".beacon/run/plugins.sock");
    };

    dirs.runtime_dir().map_or_else(
        || dirs.home_dir().join(".beacon").join("run").join("plugins.sock"),
        |runtime| runtime.join("beacon").join("plugins.sock"),
    )
}
