//! Plugin process launching

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::SupervisorConfig;
use crate::{Error, Result};

/// Environment variable carrying the filename a plugin was launched from
pub const ENV_PLUGIN_FILE: &str = "BEACON_PLUGIN_FILE";

/// Environment variable carrying the host socket address
pub const ENV_PLUGIN_SOCKET: &str = "BEACON_PLUGIN_SOCKET";

/// Environment variable carrying the writable sandbox directory
pub const ENV_PLUGIN_SANDBOX: &str = "BEACON_PLUGIN_SANDBOX";

/// Starts plugin executables by filename
pub trait Launcher: Send + Sync {
    /// Start the named plugin without waiting for it to exit
    ///
    /// # Errors
    ///
    /// Returns error if the name is not a plain filename or the process
    /// could not be started
    fn launch(&self, filename: &str) -> Result<()>;
}

/// Launches plugins as child processes of the host
///
/// Children run with the plugin directory as working directory and inherit
/// the host's stdout and stderr. Each child is handed to a background task
/// that reaps it and logs its exit status.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    plugin_dir: PathBuf,
    sandbox_dir: PathBuf,
    socket_path: PathBuf,
}

impl ProcessLauncher {
    /// Create a launcher for the configured plugin directory
    ///
    /// Sandbox and socket paths are exported to children as absolute paths.
    #[must_use]
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            plugin_dir: config.plugin_dir.clone(),
            sandbox_dir: absolute_or_unchanged(&config.sandbox_dir),
            socket_path: absolute_or_unchanged(&config.socket_path),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, filename: &str) -> Result<()> {
        validate_plugin_name(filename)?;

        // Resolved against the working directory set below
        let program = Path::new(".").join(filename);
        let mut child = Command::new(&program)
            .current_dir(&self.plugin_dir)
            .env(ENV_PLUGIN_FILE, filename)
            .env(ENV_PLUGIN_SOCKET, &self.socket_path)
            .env(ENV_PLUGIN_SANDBOX, &self.sandbox_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Launch(format!("failed to start plugin '{filename}': {e}")))?;

        let pid = child.id();
        tracing::info!(plugin = %filename, pid = ?pid, "plugin process started");

        let name = filename.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(plugin = %name, pid = ?pid, "plugin process exited");
                }
                Ok(status) => {
                    tracing::warn!(
                        plugin = %name,
                        pid = ?pid,
                        status = %status,
                        "plugin process exited with failure"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        plugin = %name,
                        pid = ?pid,
                        error = %e,
                        "failed to wait for plugin process"
                    );
                }
            }
        });

        Ok(())
    }
}

fn absolute_or_unchanged(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Ensure a plugin name is a single plain path component
///
/// Absolute paths, parent references and nested paths are rejected so a
/// launch can never leave the plugin directory.
///
/// # Errors
///
/// Returns `Launch` if the name is not a plain filename
pub fn validate_plugin_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(Error::Launch(format!(
            "plugin name must be a plain filename: '{name}'"
        ))),
    }
}
