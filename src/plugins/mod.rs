//! Plugin process supervision
//!
//! Plugins are executables dropped into a single directory. The host launches
//! each file, accepts the plugin's registration over a unix socket, tracks
//! the resulting instances, and restarts or stops them as files change.

pub mod connection;
pub mod controller;
pub mod endpoint;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod types;
pub mod watcher;

pub use connection::PluginConnection;
pub use controller::{LifecycleController, list_plugin_files};
pub use endpoint::{ChannelEndpoint, HandshakeHandler};
pub use launcher::{Launcher, ProcessLauncher, validate_plugin_name};
pub use registry::PluginRegistry;
pub use shutdown::ShutdownCoordinator;
pub use types::{PluginInstance, PluginStatus};
pub use watcher::{DirectoryWatcher, FsEvent, FsEventKind, watch_directory};
