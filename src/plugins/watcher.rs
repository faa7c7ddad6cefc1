//! Plugin directory watching
//!
//! Translates `notify` events into the three transitions the lifecycle
//! controller understands and forwards them, in delivery order, over an
//! unbounded channel. Dropping the [`DirectoryWatcher`] closes the channel.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::Result;

/// Kind of change observed for a plugin file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    /// A file appeared (created or renamed into the directory)
    Create,
    /// File contents changed
    Write,
    /// A file was removed or renamed away
    Remove,
}

/// A change to one path in the plugin directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsEvent {
    #[must_use]
    pub fn new(kind: FsEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Item delivered to the watch loop
#[derive(Debug)]
pub enum WatchMessage {
    /// A filesystem change
    Event(FsEvent),
    /// The notifier reported an error; the watch continues
    Error(String),
}

/// Map a `notify` event to plugin file transitions
///
/// Metadata-only changes and access events produce nothing. A rename that
/// carries both paths becomes a remove of the old name and a create of the
/// new one.
#[must_use]
pub fn classify(event: &Event) -> Vec<FsEvent> {
    let each = |kind: FsEventKind| -> Vec<FsEvent> {
        event
            .paths
            .iter()
            .map(|p| FsEvent::new(kind, p.clone()))
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => each(FsEventKind::Create),
        EventKind::Remove(_) => each(FsEventKind::Remove),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::To => each(FsEventKind::Create),
            RenameMode::Both => {
                let mut events = Vec::with_capacity(2);
                if let Some(from) = event.paths.first() {
                    events.push(FsEvent::new(FsEventKind::Remove, from.clone()));
                }
                if let Some(to) = event.paths.get(1) {
                    events.push(FsEvent::new(FsEventKind::Create, to.clone()));
                }
                events
            }
            RenameMode::From => each(FsEventKind::Remove),
            // Backends that cannot tell the two sides apart report both paths
            // this way; whichever still exists is the new name.
            RenameMode::Any | RenameMode::Other => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        FsEventKind::Create
                    } else {
                        FsEventKind::Remove
                    };
                    FsEvent::new(kind, p.clone())
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => Vec::new(),
        EventKind::Modify(_) => each(FsEventKind::Write),
        EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Active watch on the plugin directory
///
/// The watch stops, and the paired receiver closes, when this is dropped.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Watch `dir` non-recursively
///
/// # Errors
///
/// Returns error if the notifier cannot be created or the directory cannot
/// be watched
pub fn watch_directory(
    dir: &Path,
) -> Result<(DirectoryWatcher, mpsc::UnboundedReceiver<WatchMessage>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for fs_event in classify(&event) {
                let _ = tx.send(WatchMessage::Event(fs_event));
            }
        }
        Err(e) => {
            let _ = tx.send(WatchMessage::Error(e.to_string()));
        }
    })?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %dir.display(), "watching plugin directory");

    Ok((
        DirectoryWatcher {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        },
        rx,
    ))
}
