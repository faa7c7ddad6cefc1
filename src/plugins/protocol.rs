//! Wire messages exchanged with plugin processes
//!
//! Messages are newline-delimited JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::Result;

/// Method name of the graceful stop request
pub const STOP_METHOD: &str = "stop";

/// Registration message from a freshly spawned plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Identifier the plugin assigns itself
    pub id: String,
    /// Method names the plugin serves
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Filename the plugin was launched from (echo of `BEACON_PLUGIN_FILE`)
    #[serde(default)]
    pub source_file: Option<String>,
}

/// Outgoing message from host to plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostToPlugin {
    /// Registration accepted
    Registered { id: String },
    /// Invoke a method on the plugin
    Request {
        request_id: u64,
        method: String,
        params: serde_json::Value,
    },
    /// Error message
    Error { code: String, message: String },
}

/// Incoming message from plugin to host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginToHost {
    /// Registration message
    Register(Registration),
    /// Response to a request
    Response {
        request_id: u64,
        ok: bool,
        #[serde(default)]
        payload: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Keepalive ping
    Ping,
}

impl HostToPlugin {
    /// Build an error message
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Write one message as a JSON line
///
/// # Errors
///
/// Returns error if serialization or the write fails
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize + Sync,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
