//! Graceful plugin shutdown

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use super::registry::PluginRegistry;
use super::types::PluginStatus;
use crate::Error;

/// Stops every registered instance launched from a given file
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<PluginRegistry>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given stop deadline
    #[must_use]
    pub const fn new(registry: Arc<PluginRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Ask all live instances for `name` to stop and wait for them
    ///
    /// Instances are stopped concurrently under one shared deadline. Every
    /// instance ends up `Stopped` with its connection released, whether it
    /// acknowledged, refused, or timed out; failures are only logged.
    pub async fn stop_by_filename(&self, name: &str) {
        let targets = self.registry.connections_by_filename(name);
        if targets.is_empty() {
            tracing::debug!(plugin = %name, "no running instances to stop");
            return;
        }

        let deadline = Instant::now() + self.timeout;
        let stops = targets.into_iter().map(|(id, connection)| async move {
            let outcome = tokio::time::timeout_at(deadline, connection.stop())
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!("no stop acknowledgment from '{id}'")))
                });
            (id, connection, outcome)
        });

        for (id, connection, outcome) in join_all(stops).await {
            match outcome {
                Ok(()) => tracing::info!(plugin = %name, plugin_id = %id, "plugin stopped"),
                Err(e) => tracing::warn!(
                    plugin = %name,
                    plugin_id = %id,
                    error = %e,
                    "plugin did not stop cleanly"
                ),
            }

            self.registry.release(&id, connection.id(), PluginStatus::Stopped);
        }
    }
}
