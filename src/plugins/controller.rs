//! Filesystem-driven plugin lifecycle
//!
//! Maps plugin directory contents and change events to launcher and
//! shutdown actions:
//!
//! - create: launch the file
//! - write: stop all instances for the file, then launch it again
//! - remove or rename away: stop all instances for the file
//!
//! The startup scan feeds every file through the create transition and the
//! shutdown scan stops every file, one filename at a time.

use std::fs::DirEntry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::launcher::Launcher;
use super::shutdown::ShutdownCoordinator;
use super::watcher::{FsEvent, FsEventKind, WatchMessage};
use crate::{Error, Result};

/// Drives plugin processes from the state of the plugin directory
pub struct LifecycleController {
    plugin_dir: PathBuf,
    launcher: Arc<dyn Launcher>,
    shutdown: ShutdownCoordinator,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("plugin_dir", &self.plugin_dir)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    #[must_use]
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        launcher: Arc<dyn Launcher>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            launcher,
            shutdown,
        }
    }

    /// Launch every regular file currently in the plugin directory
    ///
    /// A file that fails to launch is logged and skipped. Returns the number
    /// of files launched successfully.
    ///
    /// # Errors
    ///
    /// Returns error if the plugin directory cannot be listed
    pub fn startup_scan(&self) -> Result<usize> {
        let files = self.list_plugin_files()?;
        let total = files.len();
        let launched = files.iter().filter(|name| self.on_create(name)).count();

        tracing::info!(total, launched, "plugin startup scan complete");
        Ok(launched)
    }

    /// Stop every file currently in the plugin directory
    ///
    /// Filenames are stopped one after another; each stop completes or times
    /// out before the next begins.
    ///
    /// # Errors
    ///
    /// Returns error if the plugin directory cannot be listed
    pub async fn shutdown_scan(&self) -> Result<()> {
        for name in self.list_plugin_files()? {
            self.on_remove(&name).await;
        }

        tracing::info!("plugin shutdown scan complete");
        Ok(())
    }

    /// Consume watch messages until the channel closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<WatchMessage>) {
        while let Some(message) = events.recv().await {
            match message {
                WatchMessage::Event(event) => self.handle_event(&event).await,
                WatchMessage::Error(e) => tracing::error!(error = %e, "plugin watcher error"),
            }
        }

        tracing::info!("plugin watch loop stopped");
    }

    /// Apply one filesystem event
    pub async fn handle_event(&self, event: &FsEvent) {
        match std::fs::metadata(&event.path) {
            Ok(meta) if meta.is_dir() => return,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    path = %event.path.display(),
                    error = %e,
                    "failed to stat plugin file"
                );
                return;
            }
        }

        let Some(name) = event.path.file_name().and_then(|n| n.to_str()) else {
            tracing::debug!(
                path = %event.path.display(),
                "ignoring event without a usable filename"
            );
            return;
        };

        match event.kind {
            FsEventKind::Create => {
                tracing::info!(plugin = %name, "plugin file created");
                self.on_create(name);
            }
            FsEventKind::Write => {
                tracing::info!(plugin = %name, "plugin file changed");
                self.on_write(name).await;
            }
            FsEventKind::Remove => {
                tracing::info!(plugin = %name, "plugin file removed");
                self.on_remove(name).await;
            }
        }
    }

    /// Launch a plugin, logging failure; returns whether it started
    fn on_create(&self, name: &str) -> bool {
        match self.launcher.launch(name) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(plugin = %name, error = %e, "failed to start plugin");
                false
            }
        }
    }

    /// Stop running instances, then relaunch regardless of the stop outcome
    async fn on_write(&self, name: &str) {
        self.shutdown.stop_by_filename(name).await;
        self.on_create(name);
    }

    async fn on_remove(&self, name: &str) {
        self.shutdown.stop_by_filename(name).await;
    }

    /// Names of the regular (non-directory) entries of the plugin directory
    fn list_plugin_files(&self) -> Result<Vec<String>> {
        list_plugin_files(&self.plugin_dir)
    }
}

/// List non-directory entries of `dir`, sorted by name
///
/// # Errors
///
/// Returns error if the directory cannot be read
pub fn list_plugin_files(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Setup(format!(
            "failed to read plugin directory {}: {e}",
            dir.display()
        ))
    })?;

    let mut names: Vec<String> = entries.filter_map(plugin_file_name).collect();
    names.sort();
    Ok(names)
}

/// Name of a directory entry that can be a plugin
///
/// Directories are skipped. Entries that cannot be read or have a non UTF-8
/// name are logged and skipped without affecting the rest of the listing.
fn plugin_file_name(entry: std::io::Result<DirEntry>) -> Option<String> {
    let entry = entry
        .inspect_err(|e| tracing::warn!(error = %e, "skipping unreadable plugin directory entry"))
        .ok()?;

    match entry.file_type() {
        Ok(kind) if kind.is_dir() => return None,
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                path = %entry.path().display(),
                error = %e,
                "skipping plugin entry of unknown type"
            );
            return None;
        }
    }

    entry
        .file_name()
        .into_string()
        .inspect_err(|raw| tracing::warn!(name = ?raw, "skipping plugin with non UTF-8 filename"))
        .ok()
}
