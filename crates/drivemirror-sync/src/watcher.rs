//! Filesystem watcher adapter
//!
//! Wraps the `notify` crate to monitor the sync root recursively, converting
//! raw OS events into `(ChangeKind, path)` notifications delivered to an
//! [`IChangeSink`]. Events for hidden files, editor temp files, and the
//! engine's state document are dropped before they reach the sink.
//!
//! ## Architecture
//!
//! ```text
//! inotify
//!    │
//!    ▼
//! DirWatcher ──filter──→ IChangeSink (ChangeRouter) ──→ ChangeQueue
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, trace};

use drivemirror_core::domain::record::ChangeKind;
use drivemirror_core::ports::change_source::{IChangeSink, IChangeSource};

/// File name suffixes that indicate a transient file not worth syncing
const IGNORED_SUFFIXES: &[&str] = &[".tmp", ".swp", ".swx", ".part", ".crdownload", "~"];

// ============================================================================
// Event filtering
// ============================================================================

/// Decides whether a path should be invisible to the sync engine
///
/// Filters hidden entries (any path component starting with `.`), known
/// temporary-file suffixes, and the state document by file name. `path`
/// must already be relative to the sync root so dotted directories in the
/// root's own absolute path don't suppress everything under it.
pub fn should_ignore(path: &Path, state_file_name: Option<&str>) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return true;
    };

    if let Some(state_name) = state_file_name {
        if name == state_name {
            return true;
        }
    }

    if IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return true;
    }

    // any hidden component hides the whole subtree
    path.components().any(|c| {
        c.as_os_str()
            .to_string_lossy()
            .starts_with('.')
    })
}

/// Converts a `notify::Event` into zero or more `(ChangeKind, path)` pairs
///
/// Renames with both paths become a delete of the old name plus a create of
/// the new one; a rename reported with a single path degrades to a
/// modification. Access events and pathless events map to nothing.
fn map_notify_event(event: &notify::Event) -> Vec<(ChangeKind, PathBuf)> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => paths
            .first()
            .map(|p| vec![(ChangeKind::Created, p.clone())])
            .unwrap_or_default(),

        EventKind::Remove(_) => paths
            .first()
            .map(|p| vec![(ChangeKind::Deleted, p.clone())])
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            vec![
                (ChangeKind::Deleted, paths[0].clone()),
                (ChangeKind::Created, paths[1].clone()),
            ]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .first()
            .map(|p| vec![(ChangeKind::Deleted, p.clone())])
            .unwrap_or_default(),

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .first()
            .map(|p| vec![(ChangeKind::Created, p.clone())])
            .unwrap_or_default(),

        EventKind::Modify(_) => paths
            .first()
            .map(|p| vec![(ChangeKind::Modified, p.clone())])
            .unwrap_or_default(),

        _ => {
            trace!(kind = ?event.kind, "ignoring event kind");
            Vec::new()
        }
    }
}

// ============================================================================
// DirWatcher
// ============================================================================

/// Recursive directory watcher delivering filtered changes to a sink
///
/// The `notify` callback runs on the watcher's own thread; the sink must be
/// thread-safe and cheap, which [`super::queue::ChangeRouter`] is.
pub struct DirWatcher {
    root: PathBuf,
    state_file_name: Option<String>,
    sink: Arc<dyn IChangeSink>,
    watcher: Option<RecommendedWatcher>,
}

impl DirWatcher {
    /// Creates a watcher for `root` that will feed `sink` once started
    ///
    /// `state_file` is only used for its file name; changes to that name
    /// anywhere under the root are suppressed.
    pub fn new(root: impl Into<PathBuf>, state_file: &Path, sink: Arc<dyn IChangeSink>) -> Self {
        Self {
            root: root.into(),
            state_file_name: state_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            sink,
            watcher: None,
        }
    }
}

impl IChangeSource for DirWatcher {
    fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        info!(root = %self.root.display(), "starting recursive watch");

        let sink = self.sink.clone();
        let state_file_name = self.state_file_name.clone();
        let root = self.root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for (kind, path) in map_notify_event(&event) {
                        let rel = path.strip_prefix(&root).unwrap_or(&path);
                        if should_ignore(rel, state_file_name.as_deref()) {
                            trace!(path = %path.display(), "filtered change");
                            continue;
                        }
                        debug!(%kind, path = %path.display(), "observed change");
                        sink.notify(kind, path);
                    }
                }
                Err(err) => {
                    error!(error = %err, "file watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("failed to create file watcher")?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch path: {}", self.root.display()))?;

        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!(root = %self.root.display(), "stopped watching");
        }
    }

    fn is_alive(&self) -> bool {
        self.watcher.is_some()
    }
}
