//! Plugin supervisor
//!
//! Owns the plugin directory, the channel endpoint and the watch loop, and
//! exposes the query surface the rest of the host uses to find plugins.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;
use crate::plugins::{
    ChannelEndpoint, DirectoryWatcher, HandshakeHandler, Launcher, LifecycleController,
    PluginInstance, PluginRegistry, ProcessLauncher, ShutdownCoordinator, watch_directory,
};
use crate::{Error, Result};

/// Resources held while the supervisor is running
#[derive(Debug)]
struct Running {
    endpoint: ChannelEndpoint,
    watcher: DirectoryWatcher,
    watch_task: JoinHandle<()>,
    controller: Arc<LifecycleController>,
}

/// Supervises plugin processes launched from one directory
pub struct PluginSupervisor {
    config: SupervisorConfig,
    registry: Arc<PluginRegistry>,
    launcher: Arc<dyn Launcher>,
    running: Option<Running>,
}

impl std::fmt::Debug for PluginSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSupervisor")
            .field("config", &self.config)
            .field("plugins", &self.registry.len())
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl PluginSupervisor {
    /// Create a supervisor that launches plugins as child processes
    ///
    /// Creates the plugin and sandbox directories and applies the configured
    /// plugin directory permissions.
    ///
    /// # Errors
    ///
    /// Returns `Setup` if a directory cannot be created or its permissions
    /// cannot be set
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(&config));
        Self::with_launcher(config, launcher)
    }

    /// Create a supervisor with a custom launcher
    ///
    /// # Errors
    ///
    /// Returns `Setup` if a directory cannot be created or its permissions
    /// cannot be set
    pub fn with_launcher(config: SupervisorConfig, launcher: Arc<dyn Launcher>) -> Result<Self> {
        prepare_directories(&config)?;

        Ok(Self {
            config,
            registry: Arc::new(PluginRegistry::new()),
            launcher,
            running: None,
        })
    }

    /// Bind the endpoint, launch every plugin present and begin watching
    ///
    /// The startup scan completes before the directory watch is opened, so
    /// each file present at boot is launched exactly once by the scan.
    ///
    /// # Errors
    ///
    /// Returns error if the supervisor is already running, the socket cannot
    /// be bound, the plugin directory cannot be listed, or the watch cannot
    /// be opened
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Setup("plugin supervisor already started".to_string()));
        }

        let mut endpoint = ChannelEndpoint::bind(&self.config.socket_path)?;
        endpoint.start(HandshakeHandler::new(
            Arc::clone(&self.registry),
            self.config.handshake_timeout,
        ));

        let controller = Arc::new(LifecycleController::new(
            &self.config.plugin_dir,
            Arc::clone(&self.launcher),
            ShutdownCoordinator::new(Arc::clone(&self.registry), self.config.stop_timeout),
        ));

        let watched = controller.startup_scan().and_then(|_| {
            watch_directory(&self.config.plugin_dir).map_err(|e| {
                Error::Setup(format!(
                    "failed to watch plugin directory {}: {e}",
                    self.config.plugin_dir.display()
                ))
            })
        });
        let (watcher, events) = match watched {
            Ok(watched) => watched,
            Err(e) => {
                endpoint.stop().await;
                return Err(e);
            }
        };

        let watch_task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(events).await }
        });

        self.running = Some(Running {
            endpoint,
            watcher,
            watch_task,
            controller,
        });

        tracing::info!(
            plugin_dir = %self.config.plugin_dir.display(),
            socket = %self.config.socket_path.display(),
            "plugin supervisor started"
        );
        Ok(())
    }

    /// Stop watching, stop every plugin, then close the endpoint
    ///
    /// Plugins are stopped one filename at a time while their connections
    /// are still served, so each receives its stop request. Does nothing if
    /// the supervisor is not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Running {
            mut endpoint,
            watcher,
            watch_task,
            controller,
        } = running;

        // Dropping the watcher closes the event channel and ends the loop
        drop(watcher);
        if let Err(e) = watch_task.await {
            tracing::warn!(error = %e, "plugin watch loop ended abnormally");
        }

        if let Err(e) = controller.shutdown_scan().await {
            tracing::warn!(error = %e, "plugin shutdown scan failed");
        }

        endpoint.stop().await;
        tracing::info!("plugin supervisor stopped");
    }

    /// Whether [`Self::start`] has completed and [`Self::stop`] has not run
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Active plugins serving any of `methods`, or every active plugin if empty
    #[must_use]
    pub fn plugins<S: AsRef<str>>(&self, methods: &[S]) -> Vec<PluginInstance> {
        self.registry.list_by_capability(methods)
    }

    /// Look up one plugin instance by ID, whatever its status
    #[must_use]
    pub fn plugin(&self, id: &str) -> Option<PluginInstance> {
        self.registry.get(id)
    }

    /// Call `method` on an active plugin and wait for its result
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the plugin is unknown or does not serve
    /// `method`, `Connection` if it is not active, `Timeout` if no response
    /// arrives within the request timeout, and `Plugin` if it reports failure
    pub async fn invoke(&self, id: &str, method: &str, params: Value) -> Result<Value> {
        let instance = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("plugin '{id}'")))?;
        if !instance.has_capability(method) {
            return Err(Error::NotFound(format!(
                "plugin '{id}' does not serve '{method}'"
            )));
        }

        let connection = self.registry.connection(id).ok_or_else(|| {
            Error::Connection(format!("plugin '{id}' is {}", instance.status))
        })?;

        tokio::time::timeout(self.config.request_timeout, connection.request(method, params))
            .await
            .map_err(|_| Error::Timeout(format!("plugin '{id}' did not answer '{method}'")))?
    }

    /// Registry shared with the endpoint and controller
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }
}

/// Create the plugin and sandbox directories and lock down the plugin directory
fn prepare_directories(config: &SupervisorConfig) -> Result<()> {
    create_dir(&config.plugin_dir)?;
    create_dir(&config.sandbox_dir)?;

    if let Some(mode) = config.plugin_dir_mode {
        set_mode(&config.plugin_dir, mode)?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        Error::Setup(format!("failed to create directory {}: {e}", path.display()))
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        Error::Setup(format!(
            "failed to set permissions {mode:o} on {}: {e}",
            path.display()
        ))
    })
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let _ = mode;
    tracing::debug!(path = %path.display(), "directory permissions not supported on this platform");
    Ok(())
}
