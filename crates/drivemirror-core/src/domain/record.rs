//! Persisted sync record model
//!
//! A [`FileRecord`] captures what the engine knew about a file the last time
//! a transfer for it succeeded. The serialized field names (`drive_id`,
//! `local_mtime`, `drive_mtime`, `checksum`) are the on-disk state-document
//! layout; absent fields are omitted from the JSON, never written as null.

use serde::{Deserialize, Serialize};

use super::newtypes::RemoteId;

// ============================================================================
// ChangeKind
// ============================================================================

/// Kind of local filesystem change reported by a change source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A new file appeared
    Created,
    /// An existing file's content changed
    Modified,
    /// A file was removed
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ============================================================================
// FileRecord
// ============================================================================

/// One entry in the persisted sync state, keyed externally by relative path
///
/// Timestamps carry different semantics per side:
/// - `local_mtime` is a float of seconds taken from local file metadata.
/// - `drive_mtime` is whatever opaque string the remote API returned; it is
///   compared only for equality and never parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Remote identifier; absent until the first successful upload or download
    #[serde(rename = "drive_id", skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,

    /// Local modification time (seconds since epoch) at the last sync
    #[serde(rename = "local_mtime", skip_serializing_if = "Option::is_none")]
    pub local_mtime: Option<f64>,

    /// Remote modification time as returned by the remote store, opaque
    #[serde(rename = "drive_mtime", skip_serializing_if = "Option::is_none")]
    pub remote_mtime: Option<String>,

    /// Content digest computed locally after the last successful transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl FileRecord {
    /// Returns true once the record carries a remote identity
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Merges only the fields present in `patch` into this record
    ///
    /// Fields the patch leaves as `None` keep their current value; there is
    /// no way to clear a field through a patch, matching the
    /// merge-on-update contract of the state store.
    pub fn apply(&mut self, patch: RecordPatch) {
        if let Some(remote_id) = patch.remote_id {
            self.remote_id = Some(remote_id);
        }
        if let Some(local_mtime) = patch.local_mtime {
            self.local_mtime = Some(local_mtime);
        }
        if let Some(remote_mtime) = patch.remote_mtime {
            self.remote_mtime = Some(remote_mtime);
        }
        if let Some(checksum) = patch.checksum {
            self.checksum = Some(checksum);
        }
    }
}

// ============================================================================
// RecordPatch
// ============================================================================

/// Partial update for a [`FileRecord`]; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub remote_id: Option<RemoteId>,
    pub local_mtime: Option<f64>,
    pub remote_mtime: Option<String>,
    pub checksum: Option<String>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_id(mut self, id: RemoteId) -> Self {
        self.remote_id = Some(id);
        self
    }

    pub fn local_mtime(mut self, mtime: f64) -> Self {
        self.local_mtime = Some(mtime);
        self
    }

    pub fn remote_mtime(mut self, mtime: impl Into<String>) -> Self {
        self.remote_mtime = Some(mtime.into());
        self
    }

    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RemoteId {
        RemoteId::new(s).unwrap()
    }

    #[test]
    fn default_record_is_not_synced() {
        let record = FileRecord::default();
        assert!(!record.is_synced());
        assert!(record.local_mtime.is_none());
    }

    #[test]
    fn apply_merges_only_provided_fields() {
        let mut record = FileRecord {
            remote_id: Some(id("old")),
            local_mtime: Some(1.0),
            remote_mtime: Some("2024-01-01T00:00:00Z".into()),
            checksum: Some("aaaa".into()),
        };

        record.apply(RecordPatch::new().local_mtime(2.5));

        assert_eq!(record.remote_id, Some(id("old")));
        assert_eq!(record.local_mtime, Some(2.5));
        assert_eq!(record.remote_mtime.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(record.checksum.as_deref(), Some("aaaa"));
    }

    #[test]
    fn apply_full_patch_replaces_everything() {
        let mut record = FileRecord::default();
        record.apply(
            RecordPatch::new()
                .remote_id(id("new"))
                .local_mtime(10.0)
                .remote_mtime("2024-06-01T12:00:00Z")
                .checksum("bbbb"),
        );
        assert!(record.is_synced());
        assert_eq!(record.remote_id, Some(id("new")));
        assert_eq!(record.checksum.as_deref(), Some("bbbb"));
    }

    #[test]
    fn absent_fields_are_omitted_from_json() {
        let record = FileRecord {
            remote_id: Some(id("abc")),
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"drive_id":"abc"}"#);
    }

    #[test]
    fn serialized_field_names_match_state_document_layout() {
        let record = FileRecord {
            remote_id: Some(id("abc")),
            local_mtime: Some(1700000000.25),
            remote_mtime: Some("2024-01-01T00:00:00.000Z".into()),
            checksum: Some("deadbeef".into()),
        };
        let value: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["drive_id"], "abc");
        assert_eq!(value["local_mtime"], 1700000000.25);
        assert_eq!(value["drive_mtime"], "2024-01-01T00:00:00.000Z");
        assert_eq!(value["checksum"], "deadbeef");
    }

    #[test]
    fn change_kind_display() {
        assert_eq!(ChangeKind::Created.to_string(), "created");
        assert_eq!(ChangeKind::Modified.to_string(), "modified");
        assert_eq!(ChangeKind::Deleted.to_string(), "deleted");
    }
}
