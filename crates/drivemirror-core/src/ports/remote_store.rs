//! Remote store port (driven/secondary port)
//!
//! Interface for the remote file store. The primary implementation targets
//! Google Drive via its v3 REST API, but the trait only assumes a flat
//! listing of named files with opaque ids and modification-time strings.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are
//!   adapter-specific and don't need domain-level classification.
//! - "Not found" is data, not an error: `get_metadata` and `search_by_name`
//!   return `Ok(None)` for an absent file so the engine can branch on it
//!   without string-matching error text.
//! - `upload` and `download` move whole files by path; the engine never
//!   holds file content in memory across the port boundary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::RemoteId;

// ============================================================================
// RemoteFile
// ============================================================================

/// Metadata for one remote file, as returned by list/metadata/search calls
///
/// This is a port-level DTO. The engine maps it onto its persisted
/// [`FileRecord`](crate::domain::FileRecord) after a successful transfer;
/// `modified` is kept as the provider's string form and compared only for
/// equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Provider-assigned identifier
    pub id: RemoteId,
    /// File name; the engine uses it as the local relative path (flat mapping)
    pub name: String,
    /// MIME type, when the provider reports one
    pub mime_type: Option<String>,
    /// Last modified timestamp in the provider's own string format
    pub modified: Option<String>,
    /// Provider-computed content checksum, opaque to the engine
    pub checksum: Option<String>,
    /// Size in bytes, when reported
    pub size: Option<u64>,
}

// ============================================================================
// IRemoteStore
// ============================================================================

/// Port trait for remote file store operations
///
/// All operations may fail; transport failures surface as errors while
/// "the file is not there" surfaces as `Ok(None)`. Implementations are
/// expected to be cheap to share behind an `Arc`.
#[async_trait::async_trait]
pub trait IRemoteStore: Send + Sync {
    /// Lists all files directly under the given folder (root when `None`)
    ///
    /// Implementations must follow pagination internally and return the
    /// complete listing; the engine treats the result as a full snapshot of
    /// the remote side.
    async fn list(&self, folder: Option<&RemoteId>) -> anyhow::Result<Vec<RemoteFile>>;

    /// Fetches current metadata for a single file
    ///
    /// Returns `Ok(None)` if the file does not exist (or was trashed).
    async fn get_metadata(&self, id: &RemoteId) -> anyhow::Result<Option<RemoteFile>>;

    /// Uploads a local file, creating or updating the remote copy
    ///
    /// When `existing` is `Some`, the content of that remote file is
    /// replaced in place and its id is retained; when `None`, a new file
    /// named `name` is created under `parent`.
    ///
    /// # Returns
    /// The id of the created or updated remote file
    async fn upload(
        &self,
        local: &Path,
        name: &str,
        parent: Option<&RemoteId>,
        existing: Option<&RemoteId>,
    ) -> anyhow::Result<RemoteId>;

    /// Downloads a remote file's content to `dest`
    ///
    /// Parent directories are created as needed and the write is atomic
    /// (no partially written file is ever visible at `dest`).
    async fn download(&self, id: &RemoteId, dest: &Path) -> anyhow::Result<()>;

    /// Deletes a remote file
    ///
    /// Deleting an already-absent file is not an error.
    async fn delete(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Creates a folder and returns its id
    async fn create_folder(&self, name: &str, parent: Option<&RemoteId>)
        -> anyhow::Result<RemoteId>;

    /// Finds a file by exact name under the given folder
    ///
    /// Returns `Ok(None)` when no file with that name exists.
    async fn search_by_name(
        &self,
        name: &str,
        parent: Option<&RemoteId>,
    ) -> anyhow::Result<Option<RemoteFile>>;
}
