//! Registry of plugin instances known to the host
//!
//! Entries are keyed by the plugin-assigned ID with a secondary index on the
//! source filename. All access goes through one mutex that is held only for
//! the in-memory operation itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::connection::PluginConnection;
use super::types::{PluginInstance, PluginStatus};

/// One tracked instance and the connection it owns while live
#[derive(Debug)]
struct PluginEntry {
    instance: PluginInstance,
    connection: Option<PluginConnection>,
    /// Connection number the entry was registered with, kept after release
    connection_id: Option<u64>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    plugins: HashMap<String, PluginEntry>,
    by_file: HashMap<String, BTreeSet<String>>,
}

impl RegistryInner {
    fn unindex(&mut self, source_file: &str, id: &str) {
        if let Some(ids) = self.by_file.get_mut(source_file) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_file.remove(source_file);
            }
        }
    }
}

/// Registry of plugin instances
#[derive(Debug, Default)]
pub struct PluginRegistry {
    inner: Mutex<RegistryInner>,
}

impl PluginRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an instance, replacing any entry with the same ID
    ///
    /// A replaced entry's connection is closed.
    pub fn insert(&self, instance: PluginInstance, connection: Option<PluginConnection>) {
        let id = instance.id.clone();
        let source_file = instance.source_file.clone();
        let entry = PluginEntry {
            instance,
            connection_id: connection.as_ref().map(PluginConnection::id),
            connection,
        };

        let mut inner = self.lock();
        if let Some(old) = inner.plugins.insert(id.clone(), entry) {
            inner.unindex(&old.instance.source_file, &id);
            if let Some(connection) = old.connection {
                tracing::debug!(plugin_id = %id, "replacing live plugin entry");
                connection.close();
            }
        }
        inner.by_file.entry(source_file).or_default().insert(id);
    }

    /// Snapshot every tracked instance regardless of status
    #[must_use]
    pub fn all(&self) -> Vec<PluginInstance> {
        self.lock()
            .plugins
            .values()
            .map(|e| e.instance.clone())
            .collect()
    }

    /// Get an instance by ID
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PluginInstance> {
        self.lock().plugins.get(id).map(|e| e.instance.clone())
    }

    /// Get every instance launched from the given filename
    #[must_use]
    pub fn get_by_filename(&self, name: &str) -> Vec<PluginInstance> {
        let inner = self.lock();
        inner
            .by_file
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.plugins.get(id))
            .map(|e| e.instance.clone())
            .collect()
    }

    /// List `Normal` instances declaring at least one of `methods`
    ///
    /// An empty `methods` slice lists every `Normal` instance. Results are
    /// ordered by ID.
    #[must_use]
    pub fn list_by_capability<S: AsRef<str>>(&self, methods: &[S]) -> Vec<PluginInstance> {
        let inner = self.lock();
        let mut results: Vec<PluginInstance> = inner
            .plugins
            .values()
            .map(|e| &e.instance)
            .filter(|p| p.is_active())
            .filter(|p| methods.is_empty() || methods.iter().any(|m| p.has_capability(m.as_ref())))
            .cloned()
            .collect();
        drop(inner);

        results.sort_by(|a, b| a.id.cmp(&b.id));
        results
    }

    /// Remove an instance, closing its connection if still held
    pub fn remove(&self, id: &str) -> Option<PluginInstance> {
        let mut inner = self.lock();
        let entry = inner.plugins.remove(id)?;
        inner.unindex(&entry.instance.source_file, id);
        drop(inner);

        if let Some(connection) = entry.connection {
            connection.close();
        }
        Some(entry.instance)
    }

    /// Promote a `Connecting` instance to `Normal` once its handshake completes
    ///
    /// Only applies if the entry still belongs to `connection_id`. Stopped
    /// and failed entries from the same file are superseded and dropped.
    pub fn activate(&self, id: &str, connection_id: u64) -> bool {
        let mut inner = self.lock();
        let source_file = match inner.plugins.get_mut(id) {
            Some(entry)
                if entry.connection_id == Some(connection_id)
                    && entry.instance.status == PluginStatus::Connecting =>
            {
                entry.instance.status = PluginStatus::Normal;
                entry.instance.source_file.clone()
            }
            _ => return false,
        };

        let superseded: Vec<String> = inner
            .by_file
            .get(&source_file)
            .into_iter()
            .flatten()
            .filter(|other| {
                inner
                    .plugins
                    .get(*other)
                    .is_some_and(|e| !e.instance.status.is_live())
            })
            .cloned()
            .collect();
        for old in superseded {
            inner.plugins.remove(&old);
            inner.unindex(&source_file, &old);
            tracing::debug!(
                plugin_id = %old,
                source_file = %source_file,
                "dropped superseded plugin entry"
            );
        }
        true
    }

    /// Handles to the live connections of every instance for `name`
    #[must_use]
    pub fn connections_by_filename(&self, name: &str) -> Vec<(String, PluginConnection)> {
        let inner = self.lock();
        inner
            .by_file
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let entry = inner.plugins.get(id)?;
                let connection = entry.connection.as_ref()?;
                entry
                    .instance
                    .status
                    .is_live()
                    .then(|| (id.clone(), connection.clone()))
            })
            .collect()
    }

    /// Handle to the connection of a `Normal` instance
    #[must_use]
    pub fn connection(&self, id: &str) -> Option<PluginConnection> {
        let inner = self.lock();
        let entry = inner.plugins.get(id)?;
        if !entry.instance.is_active() {
            return None;
        }
        entry.connection.clone()
    }

    /// Move a live instance to a terminal status and release its connection
    ///
    /// Ignored if the entry has since been re-registered on another
    /// connection or has already left the live states. Returns whether the
    /// entry changed.
    pub fn release(&self, id: &str, connection_id: u64, status: PluginStatus) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.plugins.get_mut(id) else {
            return false;
        };
        if entry.connection_id != Some(connection_id) || !entry.instance.status.is_live() {
            return false;
        }

        entry.instance.status = status;
        let connection = entry.connection.take();
        drop(inner);

        if let Some(connection) = connection {
            connection.close();
        }
        true
    }

    /// Number of tracked instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().plugins.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().plugins.is_empty()
    }
}
