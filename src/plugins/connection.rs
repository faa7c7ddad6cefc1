//! Live connection to a registered plugin
//!
//! Each handshaken plugin gets one serving task that owns the socket. The
//! rest of the host talks to it through a [`PluginConnection`] handle, which
//! queues requests and awaits their correlated responses.

use std::collections::HashMap;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, Lines};
use tokio::sync::{mpsc, oneshot, watch};

use super::protocol::{HostToPlugin, PluginToHost, STOP_METHOD, write_message};
use crate::{Error, Result};

/// Capacity of the per-connection command queue
const COMMAND_QUEUE: usize = 32;

/// Command sent from a handle to the serving task
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Send a request and deliver the response on `reply`
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    /// Release the connection
    Close,
}

/// Handle to a plugin connection
///
/// Cloning yields another handle to the same connection; the serving task
/// ends once [`PluginConnection::close`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct PluginConnection {
    id: u64,
    tx: mpsc::Sender<ConnectionCommand>,
}

impl PluginConnection {
    /// Wrap a command sender
    #[must_use]
    pub const fn new(id: u64, tx: mpsc::Sender<ConnectionCommand>) -> Self {
        Self { id, tx }
    }

    /// Create a handle together with the receiving end of its command queue
    #[must_use]
    pub fn channel(id: u64) -> (Self, mpsc::Receiver<ConnectionCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        (Self::new(id, tx), rx)
    }

    /// Host-assigned connection number, unique per endpoint
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Send a request and wait for the plugin's response
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the connection is gone and `Plugin` if the
    /// plugin answered with an error
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConnectionCommand::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| Error::Connection("connection closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Connection("connection closed before response".to_string()))?
    }

    /// Ask the plugin to shut down and wait for its acknowledgment
    ///
    /// # Errors
    ///
    /// Returns error if the request could not be delivered or was refused
    pub async fn stop(&self) -> Result<()> {
        self.request(STOP_METHOD, Value::Null).await.map(|_| ())
    }

    /// Release the connection without waiting
    pub fn close(&self) {
        let _ = self.tx.try_send(ConnectionCommand::Close);
    }
}

/// Why a serving task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The host released the connection (close, all handles dropped, or host shutdown)
    Released,
    /// The plugin closed its side cleanly
    Eof,
    /// Reading or writing failed
    Failed(String),
}

/// Serve a registered connection until it ends
///
/// Requests queued through the handle are written with increasing request
/// IDs; responses from the plugin resolve them. Pending requests fail with a
/// connection error when the task ends.
pub async fn serve<R, W>(
    plugin_id: &str,
    mut lines: Lines<R>,
    mut writer: W,
    mut commands: mpsc::Receiver<ConnectionCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> ConnectionEnd
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut next_request_id: u64 = 1;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return ConnectionEnd::Released;
                }
            }

            command = commands.recv() => {
                let Some(ConnectionCommand::Request { method, params, reply }) = command else {
                    return ConnectionEnd::Released;
                };

                let request_id = next_request_id;
                next_request_id += 1;

                let message = HostToPlugin::Request {
                    request_id,
                    method: method.clone(),
                    params,
                };
                if let Err(e) = write_message(&mut writer, &message).await {
                    let error = Error::Connection(format!("failed to send request: {e}"));
                    let _ = reply.send(Err(error));
                    return ConnectionEnd::Failed(e.to_string());
                }

                tracing::debug!(
                    plugin_id = %plugin_id,
                    request_id,
                    method = %method,
                    "sent plugin request"
                );
                pending.insert(request_id, reply);
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => handle_line(plugin_id, &text, &mut pending),
                    Ok(None) => return ConnectionEnd::Eof,
                    Err(e) => return ConnectionEnd::Failed(e.to_string()),
                }
            }
        }
    }
}

/// Dispatch one inbound line on an established connection
fn handle_line(
    plugin_id: &str,
    text: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
) {
    let incoming = match serde_json::from_str::<PluginToHost>(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::warn!(plugin_id = %plugin_id, error = %e, "ignoring malformed plugin message");
            return;
        }
    };

    match incoming {
        PluginToHost::Response {
            request_id,
            ok,
            payload,
            error,
        } => {
            let Some(reply) = pending.remove(&request_id) else {
                tracing::warn!(
                    plugin_id = %plugin_id,
                    request_id,
                    "no pending request for response"
                );
                return;
            };

            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                Err(Error::Plugin(
                    error.unwrap_or_else(|| "request failed".to_string()),
                ))
            };
            let _ = reply.send(result);
        }
        PluginToHost::Ping => {}
        PluginToHost::Register(_) => {
            tracing::warn!(plugin_id = %plugin_id, "duplicate registration ignored");
        }
    }
}
