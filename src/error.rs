//! Error types for the Beacon plugin host

use thiserror::Error;

/// Result type alias for plugin host operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the plugin host
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Directory or socket setup failed; fatal to supervisor startup
    #[error("setup error: {0}")]
    Setup(String),

    /// Plugin process could not be started
    #[error("launch error: {0}")]
    Launch(String),

    /// Plugin registration was malformed or never arrived
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Plugin connection closed or failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Request to a plugin did not complete in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Plugin returned an error for a request
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Filesystem watcher error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}
