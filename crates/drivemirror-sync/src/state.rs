//! Persisted sync state store
//!
//! The state document is a single JSON object mapping relative paths to
//! [`FileRecord`]s. Every mutation persists immediately so a crash between
//! cycles loses at most the operation in flight, and writes go through a
//! temp-file-then-rename so a crash mid-write can never corrupt the document.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use drivemirror_core::domain::record::{FileRecord, RecordPatch};

/// Errors from state document persistence
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// SyncStateStore
// ============================================================================

/// In-memory view of the state document, persisted on every mutation
///
/// Records are keyed by the file's path relative to the sync root, using
/// forward slashes. The store is deliberately synchronous; mutations are
/// small and happen between transfers, never concurrently.
pub struct SyncStateStore {
    path: PathBuf,
    records: BTreeMap<String, FileRecord>,
}

impl SyncStateStore {
    /// Open the store at `path`, loading any existing document
    ///
    /// A missing file yields an empty store. An unreadable or unparsable
    /// document is logged and treated as empty rather than failing startup;
    /// the engine rebuilds state from the next full reconciliation.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(records) => records,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state document unparsable, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state document unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self { path, records }
    }

    /// Returns the record for `rel_path`, if any
    pub fn get(&self, rel_path: &str) -> Option<&FileRecord> {
        self.records.get(rel_path)
    }

    /// Returns true if `rel_path` has a record
    pub fn contains(&self, rel_path: &str) -> bool {
        self.records.contains_key(rel_path)
    }

    /// Merges `patch` into the record for `rel_path`, creating it if absent,
    /// then persists the document
    pub fn update(&mut self, rel_path: &str, patch: RecordPatch) -> Result<(), StateStoreError> {
        self.records
            .entry(rel_path.to_string())
            .or_default()
            .apply(patch);
        self.persist()
    }

    /// Removes the record for `rel_path` and persists; removing an absent
    /// record is a no-op that still persists nothing new
    pub fn remove(&mut self, rel_path: &str) -> Result<(), StateStoreError> {
        if self.records.remove(rel_path).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// All tracked relative paths, in sorted order
    pub fn tracked_paths(&self) -> BTreeSet<String> {
        self.records.keys().cloned().collect()
    }

    /// Number of tracked files
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.records)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
