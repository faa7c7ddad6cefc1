//! Unix socket endpoint plugins dial into
//!
//! One listening socket per host lifetime. Every accepted connection must
//! register within the handshake timeout; registered connections are served
//! until they close, are released, or the endpoint stops.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{ConnectionEnd, PluginConnection, serve};
use super::protocol::{HostToPlugin, PluginToHost, Registration, write_message};
use super::registry::PluginRegistry;
use super::types::{PluginInstance, PluginStatus};
use crate::{Error, Result};

/// Accepts plugin connections on a unix socket
#[derive(Debug)]
pub struct ChannelEndpoint {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl ChannelEndpoint {
    /// Bind the socket, clearing any stale socket file first
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Setup` if the stale file cannot be removed, the socket
    /// directory cannot be created, or the address cannot be bound
    pub fn bind(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        remove_stale_socket(&socket_path)?;

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Setup(format!(
                    "failed to create socket directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            Error::Setup(format!(
                "failed to bind plugin socket {}: {e}",
                socket_path.display()
            ))
        })?;
        tracing::info!(path = %socket_path.display(), "plugin socket bound");

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            socket_path,
            listener: Some(listener),
            shutdown_tx,
            accept_task: None,
        })
    }

    /// Socket address plugins connect to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Start accepting connections, handing each to `handler`
    ///
    /// Calling this more than once has no effect.
    pub fn start(&mut self, handler: HandshakeHandler) {
        let Some(listener) = self.listener.take() else {
            tracing::debug!("plugin endpoint already started");
            return;
        };

        let handler = Arc::new(handler);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&handler);
                            let shutdown = shutdown_rx.clone();
                            tokio::spawn(async move {
                                handler.handle(stream, shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept plugin connection");
                        }
                    }
                }
            }

            tracing::debug!("plugin accept loop stopped");
        }));
    }

    /// Stop accepting, release every served connection and remove the socket file
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "plugin accept loop ended abnormally");
            }
        }
        self.listener = None;

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.socket_path.display(),
                error = %e,
                "failed to remove plugin socket"
            ),
        }

        tracing::info!("plugin endpoint stopped");
    }
}

/// Remove a socket file left behind by a previous run
///
/// A socket that still accepts connections belongs to a live host and is
/// left in place.
fn remove_stale_socket(path: &Path) -> Result<()> {
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(Error::Setup(format!(
            "plugin socket {} is in use by another host",
            path.display()
        )));
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale plugin socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Setup(format!(
            "failed to remove stale socket {}: {e}",
            path.display()
        ))),
    }
}

/// Registers plugins that connect to the endpoint
#[derive(Debug)]
pub struct HandshakeHandler {
    registry: Arc<PluginRegistry>,
    timeout: Duration,
    next_connection_id: AtomicU64,
}

impl HandshakeHandler {
    /// Create a handler that registers into `registry`
    #[must_use]
    pub const fn new(registry: Arc<PluginRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Run the handshake for one connection, then serve it until it ends
    pub async fn handle(&self, stream: UnixStream, shutdown: watch::Receiver<bool>) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let registration =
            match tokio::time::timeout(self.timeout, await_registration(&mut lines, &mut write))
                .await
            {
                Ok(Ok(registration)) => registration,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "plugin handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(timeout = ?self.timeout, "plugin did not register in time");
                    let _ = write_message(
                        &mut write,
                        &HostToPlugin::error(
                            "handshake_timeout",
                            "registration not received in time",
                        ),
                    )
                    .await;
                    return;
                }
            };

        let (id, source_file) = match validate_registration(&registration) {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting plugin registration");
                let reply = HostToPlugin::error("invalid_registration", e.to_string());
                let _ = write_message(&mut write, &reply).await;
                return;
            }
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (connection, commands) = PluginConnection::channel(connection_id);
        let instance = PluginInstance::new(&id, &source_file, registration.capabilities);
        self.registry.insert(instance, Some(connection));

        let ack = HostToPlugin::Registered { id: id.clone() };
        if let Err(e) = write_message(&mut write, &ack).await {
            tracing::warn!(plugin_id = %id, error = %e, "failed to acknowledge registration");
            self.registry.release(&id, connection_id, PluginStatus::Error);
            return;
        }

        if !self.registry.activate(&id, connection_id) {
            // Replaced or stopped between insert and acknowledgment
            tracing::debug!(plugin_id = %id, "registration superseded before activation");
            return;
        }
        tracing::info!(plugin_id = %id, plugin = %source_file, "plugin registered");

        match serve(&id, lines, write, commands, shutdown).await {
            ConnectionEnd::Released => {
                self.registry.release(&id, connection_id, PluginStatus::Stopped);
                tracing::debug!(plugin_id = %id, "plugin connection released");
            }
            ConnectionEnd::Eof => {
                self.registry.release(&id, connection_id, PluginStatus::Stopped);
                tracing::info!(plugin_id = %id, "plugin disconnected");
            }
            ConnectionEnd::Failed(e) => {
                self.registry.release(&id, connection_id, PluginStatus::Error);
                tracing::warn!(plugin_id = %id, error = %e, "plugin connection failed");
            }
        }
    }
}

/// Read messages until a registration arrives
async fn await_registration<R, W>(lines: &mut Lines<R>, write: &mut W) -> Result<Registration>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(text) = lines.next_line().await? {
        match serde_json::from_str::<PluginToHost>(&text) {
            Ok(PluginToHost::Register(registration)) => return Ok(registration),
            Ok(PluginToHost::Ping) => {}
            Ok(PluginToHost::Response { .. }) => {
                write_message(
                    write,
                    &HostToPlugin::error(
                        "invalid_message",
                        "must register before sending other messages",
                    ),
                )
                .await?;
            }
            Err(_) => {
                write_message(
                    write,
                    &HostToPlugin::error("invalid_message", "expected registration message"),
                )
                .await?;
            }
        }
    }

    Err(Error::Handshake(
        "plugin disconnected before registration".to_string(),
    ))
}

/// Check the fields a registration must carry, returning `(id, source_file)`
fn validate_registration(registration: &Registration) -> Result<(String, String)> {
    let id = registration.id.trim();
    if id.is_empty() {
        return Err(Error::Handshake("registration has an empty id".to_string()));
    }

    let source_file = registration
        .source_file
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| Error::Handshake(format!("registration for '{id}' has no source_file")))?;

    Ok((id.to_string(), source_file.to_string()))
}
