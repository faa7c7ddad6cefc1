//! Plugin instance types

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a plugin instance
///
/// `Connecting -> Normal -> Stopped`, with `Error` as a sink for failed
/// handshakes and broken connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Registration received, acknowledgment not yet delivered
    Connecting,
    /// Handshake complete; visible to queries
    Normal,
    /// Stopped gracefully or connection closed
    Stopped,
    /// Handshake failed or connection broke unexpectedly
    Error,
}

impl PluginStatus {
    /// Whether the instance still holds a live connection
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Normal)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Normal => write!(f, "normal"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of one handshaken plugin connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInstance {
    /// Identifier the plugin assigned itself during handshake
    pub id: String,
    /// Filename in the plugin directory the process was launched from
    pub source_file: String,
    /// Current lifecycle status
    pub status: PluginStatus,
    /// Method names the instance declared it serves
    pub capabilities: BTreeSet<String>,
    /// When the registration arrived
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl PluginInstance {
    /// Create an instance in the `Connecting` state
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source_file: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_file: source_file.into(),
            status: PluginStatus::Connecting,
            capabilities: capabilities.into_iter().collect(),
            connected_at: chrono::Utc::now(),
        }
    }

    /// Whether the instance declared the given method
    #[must_use]
    pub fn has_capability(&self, method: &str) -> bool {
        self.capabilities.contains(method)
    }

    /// Whether the instance is visible to listing and capability queries
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Normal
    }
}
