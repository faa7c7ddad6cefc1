//! Beacon plugin host - local plugin process supervision
//!
//! This library runs the plugins of a Beacon host:
//! - Launching every executable in the plugin directory
//! - Accepting plugin registrations over a unix socket
//! - Restarting or stopping plugins as their files change
//! - Answering capability queries and forwarding calls to plugins
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Plugin directory                     │
//! │        startup scan  │  notify watch  │  shutdown scan│
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                Lifecycle controller                   │
//! │      Process launcher  │  Shutdown coordinator        │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │   Channel endpoint (unix socket)  →  Plugin registry  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod plugins;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::{Error, Result};
pub use plugins::{PluginInstance, PluginRegistry, PluginStatus};
pub use supervisor::PluginSupervisor;
