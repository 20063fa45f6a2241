//! Coalescing pending-change sets
//!
//! [`ChangeQueue`] is the buffer between the watcher thread and the engine's
//! async cycle loop. It holds three sets of relative paths rather than an
//! event log, so a file touched fifty times between cycles still costs one
//! transfer. [`ChangeRouter`] is the watcher-facing sink that relativizes
//! absolute paths against the sync root and routes them into the queue.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use drivemirror_core::domain::record::ChangeKind;
use drivemirror_core::ports::change_source::IChangeSink;

// ============================================================================
// ChangeQueue
// ============================================================================

/// Changes drained from the queue for one reconciliation pass
///
/// The engine processes `deleted` before `created` and `modified` so a
/// rename observed as delete-then-create never resurrects the old name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingChanges {
    pub created: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }
}

/// Thread-safe set of pending local changes, keyed by relative path
///
/// A path lives in at most one set at a time; a later event for the same
/// path supersedes the earlier classification (create then delete collapses
/// to delete, delete then create collapses to create).
#[derive(Default)]
pub struct ChangeQueue {
    inner: Mutex<PendingChanges>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `rel_path` changed in the given way
    pub fn enqueue(&self, kind: ChangeKind, rel_path: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            ChangeKind::Created => {
                inner.deleted.remove(&rel_path);
                // a path we were already tracking as modified stays modified
                if !inner.modified.contains(&rel_path) {
                    inner.created.insert(rel_path);
                }
            }
            ChangeKind::Modified => {
                inner.deleted.remove(&rel_path);
                // create-then-modify is still one create from the engine's view
                if !inner.created.contains(&rel_path) {
                    inner.modified.insert(rel_path);
                }
            }
            ChangeKind::Deleted => {
                inner.created.remove(&rel_path);
                inner.modified.remove(&rel_path);
                inner.deleted.insert(rel_path);
            }
        }
    }

    /// Takes everything pending, leaving the queue empty
    pub fn drain_all(&self) -> PendingChanges {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *inner)
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ============================================================================
// ChangeRouter
// ============================================================================

/// Watcher-facing sink that relativizes paths and feeds the queue
///
/// Paths outside the root and the engine's own state file are dropped here
/// as a second line of defense behind the watcher's own filtering.
pub struct ChangeRouter {
    root: PathBuf,
    state_file_name: Option<String>,
    queue: Arc<ChangeQueue>,
}

impl ChangeRouter {
    pub fn new(root: impl Into<PathBuf>, state_file: &Path, queue: Arc<ChangeQueue>) -> Self {
        Self {
            root: root.into(),
            state_file_name: state_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            queue,
        }
    }

    fn relativize(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.is_empty() {
            return None;
        }
        Some(rel)
    }
}

impl IChangeSink for ChangeRouter {
    fn notify(&self, kind: ChangeKind, path: PathBuf) {
        let Some(rel) = self.relativize(&path) else {
            trace!(path = %path.display(), "change outside sync root, ignored");
            return;
        };
        if let Some(state_name) = &self.state_file_name {
            if rel == *state_name {
                return;
            }
        }
        debug!(%kind, path = %rel, "local change queued");
        self.queue.enqueue(kind, rel);
    }
}
