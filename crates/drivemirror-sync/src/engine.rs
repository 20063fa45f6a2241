//! Bidirectional reconciliation engine
//!
//! The engine owns the sync loop: an initial full reconciliation of both
//! sides, then periodic cycles that push queued local changes and pull
//! remote ones. Each cycle is level-triggered; it compares current state
//! against the persisted records rather than replaying an event log, so a
//! missed cycle is recovered by the next one.
//!
//! Per-file failures never abort a cycle. They are logged, counted in the
//! [`CycleSummary`], and retried naturally when the next cycle observes the
//! same difference.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drivemirror_core::domain::newtypes::RemoteId;
use drivemirror_core::domain::record::{ChangeKind, RecordPatch};
use drivemirror_core::ports::change_source::IChangeSource;
use drivemirror_core::ports::remote_store::{IRemoteStore, RemoteFile};

use crate::queue::ChangeQueue;
use crate::state::SyncStateStore;
use crate::watcher::should_ignore;

/// MIME type Drive uses for folders; folder entries are skipped in listings
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

// ============================================================================
// EngineState
// ============================================================================

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not running
    Stopped,
    /// Performing the initial full reconciliation
    Initializing,
    /// Executing periodic cycles
    Running,
    /// Cancellation observed, finishing the current cycle
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Initializing => "initializing",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ============================================================================
// CycleSummary
// ============================================================================

/// Outcome counters for one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    /// Files uploaded to the remote store
    pub uploaded: usize,
    /// Files downloaded into the local root
    pub downloaded: usize,
    /// Remote files deleted because their local copy went away
    pub deleted_remote: usize,
    /// Local files deleted because their remote copy went away
    pub deleted_local: usize,
    /// Per-file failures, as display strings
    pub errors: Vec<String>,
}

impl CycleSummary {
    /// Total number of transfers and deletions performed
    pub fn operations(&self) -> usize {
        self.uploaded + self.downloaded + self.deleted_remote + self.deleted_local
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_error(&mut self, rel_path: &str, err: &anyhow::Error) {
        warn!(path = %rel_path, error = %err, "sync operation failed");
        self.errors.push(format!("{rel_path}: {err:#}"));
    }
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Bidirectional sync engine between a local root and a remote folder
pub struct SyncEngine {
    remote: Arc<dyn IRemoteStore>,
    state: SyncStateStore,
    queue: Arc<ChangeQueue>,
    root: PathBuf,
    folder: Option<RemoteId>,
    poll_interval: Duration,
    cancel: CancellationToken,
    engine_state: EngineState,
    change_source: Option<Box<dyn IChangeSource>>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn IRemoteStore>,
        state: SyncStateStore,
        queue: Arc<ChangeQueue>,
        root: impl Into<PathBuf>,
        folder: Option<RemoteId>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            state,
            queue,
            root: root.into(),
            folder,
            poll_interval,
            cancel,
            engine_state: EngineState::Stopped,
            change_source: None,
        }
    }

    /// Hands the engine the change source feeding its queue
    ///
    /// The engine stops the source when it transitions to Stopping, before
    /// the final queue drain, so no event can arrive mid-drain and be lost.
    pub fn with_change_source(mut self, source: Box<dyn IChangeSource>) -> Self {
        self.change_source = Some(source);
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.engine_state
    }

    /// Number of files with persisted sync records
    pub fn tracked_files(&self) -> usize {
        self.state.len()
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Runs until the cancellation token fires
    ///
    /// Performs the initial reconciliation, then one cycle per poll
    /// interval. Cycle-level failures (listing the remote, typically) are
    /// logged and the loop keeps going; the next tick retries.
    pub async fn run(&mut self) -> Result<()> {
        self.engine_state = EngineState::Initializing;
        info!(root = %self.root.display(), "starting initial reconciliation");

        match self.initial_sync().await {
            Ok(summary) => {
                info!(
                    uploaded = summary.uploaded,
                    downloaded = summary.downloaded,
                    errors = summary.errors.len(),
                    "initial reconciliation complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "initial reconciliation failed, continuing with periodic cycles");
            }
        }

        self.engine_state = EngineState::Running;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately, consume it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.engine_state = EngineState::Stopping;
                    info!("cancellation received, stopping sync loop");
                    // stop the event source first so the final drain sees a
                    // settled queue, then push whatever was accepted
                    if let Some(source) = self.change_source.as_mut() {
                        source.stop();
                    }
                    let mut summary = CycleSummary::default();
                    self.process_pending(&mut summary).await;
                    if summary.operations() > 0 {
                        info!(
                            uploaded = summary.uploaded,
                            deleted_remote = summary.deleted_remote,
                            "final drain complete"
                        );
                    }
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.run_cycle().await;
                    if summary.operations() > 0 || !summary.is_clean() {
                        info!(
                            uploaded = summary.uploaded,
                            downloaded = summary.downloaded,
                            deleted_remote = summary.deleted_remote,
                            deleted_local = summary.deleted_local,
                            errors = summary.errors.len(),
                            "cycle complete"
                        );
                    } else {
                        debug!("cycle complete, nothing to do");
                    }
                }
            }
        }

        self.engine_state = EngineState::Stopped;
        Ok(())
    }

    // ========================================================================
    // Initial reconciliation
    // ========================================================================

    /// Full two-sided reconciliation, run once at startup
    ///
    /// Walks the union of remote listing, local tree, and tracked records:
    /// - untracked remote files are downloaded, even over an untracked local
    ///   copy of the same name (remote-first, so a freshly cloned local
    ///   folder converges by downloading instead of re-uploading)
    /// - untracked local files the remote has never seen are uploaded
    /// - tracked files missing locally are restored from the remote copy;
    ///   local deletions reach the remote only through queued watcher
    ///   events, never by inference from an absent file
    /// - tracked files the remote dropped are deleted locally
    /// - tracked files whose remote mtime changed are re-downloaded, and
    ///   those whose local content changed are re-uploaded
    pub async fn initial_sync(&mut self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        let folder = self.folder.clone();
        let listing = self
            .remote
            .list(folder.as_ref())
            .await
            .context("failed to list remote folder")?;
        let remote_files: Vec<RemoteFile> = listing
            .into_iter()
            .filter(|f| f.mime_type.as_deref() != Some(FOLDER_MIME))
            .collect();
        let remote_names: BTreeSet<String> =
            remote_files.iter().map(|f| f.name.clone()).collect();

        let local_files = self.walk_local()?;
        let tracked = self.state.tracked_paths();

        // Remote side of the union
        for remote_file in &remote_files {
            let rel = &remote_file.name;
            let local_exists = local_files.contains(rel);
            let record = self.state.get(rel).cloned();

            let outcome = match record {
                None => self.download_file(remote_file, &mut summary).await,
                Some(_) if !local_exists => {
                    debug!(path = %rel, "local copy missing, restoring from remote");
                    self.download_file(remote_file, &mut summary).await
                }
                Some(record) => {
                    let remote_changed = remote_file.modified.is_some()
                        && remote_file.modified != record.remote_mtime;
                    if remote_changed {
                        self.download_file(remote_file, &mut summary).await
                    } else {
                        self.push_if_content_changed(rel, &record.checksum, &mut summary)
                            .await
                    }
                }
            };
            if let Err(e) = outcome {
                summary.record_error(rel, &e);
            }
        }

        // Tracked files the remote no longer has
        for rel in &tracked {
            if remote_names.contains(rel) {
                continue;
            }
            let synced = self.state.get(rel).map(|r| r.is_synced()).unwrap_or(false);
            if !synced {
                continue;
            }
            debug!(path = %rel, "remote copy gone, propagating deletion locally");
            if let Err(e) = self.delete_local_file(rel, &mut summary) {
                summary.record_error(rel, &e);
            }
        }

        // Local files the remote has never seen
        for rel in &local_files {
            if remote_names.contains(rel) || self.state.contains(rel) {
                continue;
            }
            if let Err(e) = self.upload_file(rel, None, &mut summary).await {
                summary.record_error(rel, &e);
            }
        }

        Ok(summary)
    }

    // ========================================================================
    // Periodic cycle
    // ========================================================================

    /// One reconciliation pass: queued local changes first, remote pull second
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        self.process_pending(&mut summary).await;
        if let Err(e) = self.pull_remote(&mut summary).await {
            warn!(error = %e, "remote pull failed, will retry next cycle");
            summary.errors.push(format!("pull: {e:#}"));
        }
        summary
    }

    /// Drains the change queue and pushes each change to the remote
    ///
    /// Deletions run before creations so a rename observed as
    /// delete-then-create never ends with the old name restored.
    async fn process_pending(&mut self, summary: &mut CycleSummary) {
        let pending = self.queue.drain_all();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "processing queued local changes");

        for rel in &pending.deleted {
            let remote_id = self.state.get(rel).and_then(|r| r.remote_id.clone());
            let result = match remote_id {
                Some(id) => self.delete_remote_file(rel, &id, summary).await,
                // never uploaded, just forget it
                None => self.state.remove(rel).map_err(Into::into),
            };
            if let Err(e) = result {
                summary.record_error(rel, &e);
                // requeue so the deletion is retried next cycle
                self.queue.enqueue(ChangeKind::Deleted, rel.clone());
            }
        }

        for (kind, rel) in pending
            .created
            .iter()
            .map(|r| (ChangeKind::Created, r))
            .chain(pending.modified.iter().map(|r| (ChangeKind::Modified, r)))
        {
            if !self.abs_path(rel).is_file() {
                // deleted again before we got to it
                continue;
            }
            let existing = self.state.get(rel).and_then(|r| r.remote_id.clone());
            let previous_checksum = self.state.get(rel).and_then(|r| r.checksum.clone());
            let result = if existing.is_some() {
                self.push_if_content_changed(rel, &previous_checksum, summary)
                    .await
            } else {
                self.upload_file(rel, None, summary).await
            };
            if let Err(e) = result {
                summary.record_error(rel, &e);
                // requeue so the upload is retried next cycle
                self.queue.enqueue(kind, rel.clone());
            }
        }
    }

    /// Applies remote-side changes: new files, updated files, deletions
    async fn pull_remote(&mut self, summary: &mut CycleSummary) -> Result<()> {
        let folder = self.folder.clone();
        let listing = self
            .remote
            .list(folder.as_ref())
            .await
            .context("failed to list remote folder")?;
        let remote_files: Vec<RemoteFile> = listing
            .into_iter()
            .filter(|f| f.mime_type.as_deref() != Some(FOLDER_MIME))
            .collect();
        let remote_names: BTreeSet<String> =
            remote_files.iter().map(|f| f.name.clone()).collect();

        for remote_file in &remote_files {
            let rel = &remote_file.name;
            let result = match self.state.get(rel).cloned() {
                None => self.download_file(remote_file, summary).await,
                Some(record) => {
                    let remote_changed = remote_file.modified.is_some()
                        && remote_file.modified != record.remote_mtime;
                    // an absent local copy is restored, never inferred as a
                    // deletion; deletions arrive only as queued events
                    if remote_changed || !self.abs_path(rel).is_file() {
                        self.download_file(remote_file, summary).await
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = result {
                summary.record_error(rel, &e);
            }
        }

        for rel in self.state.tracked_paths() {
            if remote_names.contains(&rel) {
                continue;
            }
            let synced = self.state.get(&rel).map(|r| r.is_synced()).unwrap_or(false);
            if !synced {
                continue;
            }
            debug!(path = %rel, "remote copy gone, propagating deletion locally");
            if let Err(e) = self.delete_local_file(&rel, summary) {
                summary.record_error(&rel, &e);
            }
        }

        Ok(())
    }

    // ========================================================================
    // Per-file operations
    // ========================================================================

    async fn upload_file(
        &mut self,
        rel: &str,
        existing: Option<&RemoteId>,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let abs = self.abs_path(rel);
        let folder = self.folder.clone();

        debug!(path = %rel, updating = existing.is_some(), "uploading");
        let id = self
            .remote
            .upload(&abs, rel, folder.as_ref(), existing)
            .await
            .with_context(|| format!("upload of '{rel}' failed"))?;

        let checksum = sha256_file(&abs)?;
        let local_mtime = local_mtime_secs(&abs)?;
        let remote_mtime = self
            .remote
            .get_metadata(&id)
            .await
            .ok()
            .flatten()
            .and_then(|m| m.modified);

        let mut patch = RecordPatch::new()
            .remote_id(id)
            .local_mtime(local_mtime)
            .checksum(checksum);
        if let Some(mtime) = remote_mtime {
            patch = patch.remote_mtime(mtime);
        }
        self.state.update(rel, patch)?;
        summary.uploaded += 1;
        Ok(())
    }

    /// Re-uploads `rel` only when its content digest differs from the record
    async fn push_if_content_changed(
        &mut self,
        rel: &str,
        previous_checksum: &Option<String>,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let abs = self.abs_path(rel);
        let current = sha256_file(&abs)?;
        if previous_checksum.as_deref() == Some(current.as_str()) {
            debug!(path = %rel, "content unchanged, skipping upload");
            return Ok(());
        }
        let existing = self.state.get(rel).and_then(|r| r.remote_id.clone());
        self.upload_file(rel, existing.as_ref(), summary).await
    }

    async fn download_file(
        &mut self,
        remote_file: &RemoteFile,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let rel = &remote_file.name;
        let abs = self.abs_path(rel);

        debug!(path = %rel, id = %remote_file.id, "downloading");
        self.remote
            .download(&remote_file.id, &abs)
            .await
            .with_context(|| format!("download of '{rel}' failed"))?;

        let checksum = sha256_file(&abs)?;
        let local_mtime = local_mtime_secs(&abs)?;
        let mut patch = RecordPatch::new()
            .remote_id(remote_file.id.clone())
            .local_mtime(local_mtime)
            .checksum(checksum);
        if let Some(mtime) = &remote_file.modified {
            patch = patch.remote_mtime(mtime.clone());
        }
        self.state.update(rel, patch)?;
        summary.downloaded += 1;
        Ok(())
    }

    async fn delete_remote_file(
        &mut self,
        rel: &str,
        id: &RemoteId,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        self.remote
            .delete(id)
            .await
            .with_context(|| format!("remote delete of '{rel}' failed"))?;
        self.state.remove(rel)?;
        summary.deleted_remote += 1;
        Ok(())
    }

    fn delete_local_file(&mut self, rel: &str, summary: &mut CycleSummary) -> Result<()> {
        let abs = self.abs_path(rel);
        match std::fs::remove_file(&abs) {
            Ok(()) => {}
            // already gone locally, only the record needs cleanup
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("local delete of '{rel}' failed"));
            }
        }
        self.state.remove(rel)?;
        summary.deleted_local += 1;
        Ok(())
    }

    // ========================================================================
    // Local tree helpers
    // ========================================================================

    fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Collects relative paths of all sync-eligible files under the root
    fn walk_local(&self) -> Result<BTreeSet<String>> {
        let mut files = BTreeSet::new();
        let state_file_name = self
            .state
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        walk_directory(
            &self.root,
            &self.root,
            state_file_name.as_deref(),
            &mut files,
        )?;
        Ok(files)
    }
}

fn walk_directory(
    root: &Path,
    dir: &Path,
    state_file_name: Option<&str>,
    out: &mut BTreeSet<String>,
) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if should_ignore(rel, state_file_name) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_directory(root, &path, state_file_name, out)?;
        } else if file_type.is_file() {
            out.insert(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Hex SHA-256 digest of a file's content
pub fn sha256_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)
        .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

/// File modification time as fractional seconds since the epoch
pub fn local_mtime_secs(path: &Path) -> Result<f64> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat file: {}", path.display()))?;
    let mtime = metadata
        .modified()
        .context("filesystem does not report modification times")?;
    let since_epoch = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(since_epoch.as_secs_f64())
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory remote store with transfer counters
    #[derive(Default)]
    struct MockRemote {
        files: Mutex<HashMap<String, (RemoteFile, Vec<u8>)>>,
        uploads: Mutex<usize>,
        downloads: Mutex<usize>,
        deletes: Mutex<usize>,
        fail_uploads_for: Mutex<BTreeSet<String>>,
        next_id: Mutex<u64>,
    }

    impl MockRemote {
        fn with_file(self, name: &str, content: &[u8], mtime: &str) -> Self {
            let id = self.mint_id();
            self.files.lock().unwrap().insert(
                name.to_string(),
                (
                    RemoteFile {
                        id,
                        name: name.to_string(),
                        mime_type: Some("application/octet-stream".into()),
                        modified: Some(mtime.to_string()),
                        checksum: None,
                        size: Some(content.len() as u64),
                    },
                    content.to_vec(),
                ),
            );
            self
        }

        fn mint_id(&self) -> RemoteId {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            RemoteId::new(format!("id-{next}")).unwrap()
        }

        fn fail_upload_of(&self, name: &str) {
            self.fail_uploads_for
                .lock()
                .unwrap()
                .insert(name.to_string());
        }

        fn upload_count(&self) -> usize {
            *self.uploads.lock().unwrap()
        }

        fn download_count(&self) -> usize {
            *self.downloads.lock().unwrap()
        }

        fn delete_count(&self) -> usize {
            *self.deletes.lock().unwrap()
        }

        fn has(&self, name: &str) -> bool {
            self.files.lock().unwrap().contains_key(name)
        }

        fn content_of(&self, name: &str) -> Option<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(name)
                .map(|(_, c)| c.clone())
        }

        fn remove(&self, name: &str) {
            self.files.lock().unwrap().remove(name);
        }

        fn touch(&self, name: &str, content: &[u8], mtime: &str) {
            let mut files = self.files.lock().unwrap();
            if let Some((meta, data)) = files.get_mut(name) {
                meta.modified = Some(mtime.to_string());
                *data = content.to_vec();
            }
        }
    }

    #[async_trait::async_trait]
    impl IRemoteStore for MockRemote {
        async fn list(&self, _folder: Option<&RemoteId>) -> Result<Vec<RemoteFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .values()
                .map(|(f, _)| f.clone())
                .collect())
        }

        async fn get_metadata(&self, id: &RemoteId) -> Result<Option<RemoteFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .values()
                .map(|(f, _)| f.clone())
                .find(|f| f.id == *id))
        }

        async fn upload(
            &self,
            local: &Path,
            name: &str,
            _parent: Option<&RemoteId>,
            existing: Option<&RemoteId>,
        ) -> Result<RemoteId> {
            if self.fail_uploads_for.lock().unwrap().contains(name) {
                anyhow::bail!("simulated upload failure");
            }
            let content = std::fs::read(local)?;
            *self.uploads.lock().unwrap() += 1;
            let id = match existing {
                Some(id) => id.clone(),
                None => self.mint_id(),
            };
            self.files.lock().unwrap().insert(
                name.to_string(),
                (
                    RemoteFile {
                        id: id.clone(),
                        name: name.to_string(),
                        mime_type: Some("application/octet-stream".into()),
                        modified: Some("2024-01-01T00:00:00Z".into()),
                        checksum: None,
                        size: Some(content.len() as u64),
                    },
                    content,
                ),
            );
            Ok(id)
        }

        async fn download(&self, id: &RemoteId, dest: &Path) -> Result<()> {
            let content = self
                .files
                .lock()
                .unwrap()
                .values()
                .find(|(f, _)| f.id == *id)
                .map(|(_, c)| c.clone())
                .context("no such remote file")?;
            *self.downloads.lock().unwrap() += 1;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, content)?;
            Ok(())
        }

        async fn delete(&self, id: &RemoteId) -> Result<()> {
            *self.deletes.lock().unwrap() += 1;
            self.files
                .lock()
                .unwrap()
                .retain(|_, (f, _)| f.id != *id);
            Ok(())
        }

        async fn create_folder(
            &self,
            _name: &str,
            _parent: Option<&RemoteId>,
        ) -> Result<RemoteId> {
            Ok(self.mint_id())
        }

        async fn search_by_name(
            &self,
            name: &str,
            _parent: Option<&RemoteId>,
        ) -> Result<Option<RemoteFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(name)
                .map(|(f, _)| f.clone()))
        }
    }

    struct Harness {
        remote: Arc<MockRemote>,
        engine: SyncEngine,
        queue: Arc<ChangeQueue>,
        root: tempfile::TempDir,
        _state_dir: tempfile::TempDir,
    }

    fn harness(remote: MockRemote) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let state = SyncStateStore::open(state_dir.path().join(".mirror_state.json"));
        let remote = Arc::new(remote);
        let queue = Arc::new(ChangeQueue::new());
        let engine = SyncEngine::new(
            remote.clone(),
            state,
            queue.clone(),
            root.path(),
            None,
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        Harness {
            remote,
            engine,
            queue,
            root,
            _state_dir: state_dir,
        }
    }

    fn write_local(h: &Harness, rel: &str, content: &[u8]) {
        let path = h.root.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn read_local(h: &Harness, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(h.root.path().join(rel)).ok()
    }

    // ------------------------------------------------------------------
    // Initial reconciliation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn initial_sync_merges_disjoint_sides() {
        let remote =
            MockRemote::default().with_file("report.pdf", b"pdf bytes", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        write_local(&h, "notes.txt", b"local notes");

        let summary = h.engine.initial_sync().await.unwrap();

        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.downloaded, 1);
        assert!(summary.is_clean());
        assert!(h.remote.has("notes.txt"));
        assert_eq!(read_local(&h, "report.pdf").unwrap(), b"pdf bytes");
        assert_eq!(h.engine.tracked_files(), 2);
    }

    #[tokio::test]
    async fn initial_sync_is_idempotent() {
        let remote =
            MockRemote::default().with_file("report.pdf", b"pdf bytes", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        write_local(&h, "notes.txt", b"local notes");

        h.engine.initial_sync().await.unwrap();
        let uploads = h.remote.upload_count();
        let downloads = h.remote.download_count();

        let second = h.engine.initial_sync().await.unwrap();
        assert_eq!(second.operations(), 0);
        assert_eq!(h.remote.upload_count(), uploads);
        assert_eq!(h.remote.download_count(), downloads);
    }

    #[tokio::test]
    async fn initial_sync_downloads_remote_when_both_exist_untracked() {
        let remote =
            MockRemote::default().with_file("shared.txt", b"remote copy", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        write_local(&h, "shared.txt", b"local copy");

        let summary = h.engine.initial_sync().await.unwrap();

        assert_eq!(summary.uploaded, 0);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(read_local(&h, "shared.txt").unwrap(), b"remote copy");
    }

    #[tokio::test]
    async fn initial_sync_restores_missing_local_file() {
        let remote =
            MockRemote::default().with_file("lost.txt", b"bytes", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        h.engine.initial_sync().await.unwrap();

        // the local copy vanishes with no watcher event (crash, moved root)
        std::fs::remove_file(h.root.path().join("lost.txt")).unwrap();

        let summary = h.engine.initial_sync().await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.deleted_remote, 0);
        assert!(h.remote.has("lost.txt"));
        assert_eq!(h.remote.delete_count(), 0);
        assert_eq!(read_local(&h, "lost.txt").unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn cycle_redownloads_missing_local_file_without_remote_delete() {
        let remote =
            MockRemote::default().with_file("lost.txt", b"bytes", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        h.engine.initial_sync().await.unwrap();

        // no Deleted event is queued, so this is not a local deletion
        std::fs::remove_file(h.root.path().join("lost.txt")).unwrap();

        let summary = h.engine.run_cycle().await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.deleted_remote, 0);
        assert_eq!(h.remote.delete_count(), 0);
        assert_eq!(read_local(&h, "lost.txt").unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn initial_sync_reuploads_offline_local_edits() {
        let mut h = harness(MockRemote::default());
        write_local(&h, "draft.txt", b"v1");
        h.engine.initial_sync().await.unwrap();

        // edited while the daemon was not running, so no event was queued
        write_local(&h, "draft.txt", b"v2");

        let summary = h.engine.initial_sync().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(h.remote.content_of("draft.txt").unwrap(), b"v2");
    }

    #[tokio::test]
    async fn initial_sync_skips_folder_entries() {
        let remote = MockRemote::default();
        {
            let id = remote.mint_id();
            remote.files.lock().unwrap().insert(
                "Photos".into(),
                (
                    RemoteFile {
                        id,
                        name: "Photos".into(),
                        mime_type: Some(FOLDER_MIME.into()),
                        modified: None,
                        checksum: None,
                        size: None,
                    },
                    Vec::new(),
                ),
            );
        }
        let mut h = harness(remote);

        let summary = h.engine.initial_sync().await.unwrap();
        assert_eq!(summary.operations(), 0);
        assert!(read_local(&h, "Photos").is_none());
    }

    // ------------------------------------------------------------------
    // Periodic cycles
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn quiet_cycle_does_no_transfers() {
        let remote =
            MockRemote::default().with_file("a.txt", b"bytes", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        h.engine.initial_sync().await.unwrap();
        let downloads = h.remote.download_count();

        let summary = h.engine.run_cycle().await;
        assert_eq!(summary.operations(), 0);
        assert_eq!(h.remote.download_count(), downloads);
    }

    #[tokio::test]
    async fn queued_create_is_uploaded() {
        let mut h = harness(MockRemote::default());
        h.engine.initial_sync().await.unwrap();

        write_local(&h, "fresh.txt", b"fresh content");
        h.queue.enqueue(ChangeKind::Created, "fresh.txt".into());

        let summary = h.engine.run_cycle().await;
        assert_eq!(summary.uploaded, 1);
        assert_eq!(h.remote.content_of("fresh.txt").unwrap(), b"fresh content");
    }

    #[tokio::test]
    async fn queued_modify_with_unchanged_content_is_skipped() {
        let mut h = harness(MockRemote::default());
        write_local(&h, "a.txt", b"same bytes");
        h.engine.initial_sync().await.unwrap();
        let uploads = h.remote.upload_count();

        // mtime-only touch: watcher fires but content is identical
        h.queue.enqueue(ChangeKind::Modified, "a.txt".into());
        let summary = h.engine.run_cycle().await;

        assert_eq!(summary.uploaded, 0);
        assert!(summary.is_clean());
        assert_eq!(h.remote.upload_count(), uploads);
    }

    #[tokio::test]
    async fn queued_modify_with_new_content_reuploads_same_id() {
        let mut h = harness(MockRemote::default());
        write_local(&h, "a.txt", b"v1");
        h.engine.initial_sync().await.unwrap();
        let original_id = h
            .remote
            .search_by_name("a.txt", None)
            .await
            .unwrap()
            .unwrap()
            .id;

        write_local(&h, "a.txt", b"v2");
        h.queue.enqueue(ChangeKind::Modified, "a.txt".into());
        let summary = h.engine.run_cycle().await;

        assert_eq!(summary.uploaded, 1);
        assert_eq!(h.remote.content_of("a.txt").unwrap(), b"v2");
        let current_id = h
            .remote
            .search_by_name("a.txt", None)
            .await
            .unwrap()
            .unwrap()
            .id;
        assert_eq!(current_id, original_id);
    }

    #[tokio::test]
    async fn queued_delete_removes_remote_exactly_once() {
        let mut h = harness(MockRemote::default());
        write_local(&h, "a.txt", b"bytes");
        h.engine.initial_sync().await.unwrap();

        std::fs::remove_file(h.root.path().join("a.txt")).unwrap();
        h.queue.enqueue(ChangeKind::Deleted, "a.txt".into());

        let summary = h.engine.run_cycle().await;
        assert_eq!(summary.deleted_remote, 1);
        assert!(!h.remote.has("a.txt"));
        assert_eq!(h.remote.delete_count(), 1);

        // next cycle must not see a phantom remote deletion to mirror back
        let second = h.engine.run_cycle().await;
        assert_eq!(second.operations(), 0);
        assert_eq!(h.remote.delete_count(), 1);
    }

    #[tokio::test]
    async fn remote_deletion_propagates_locally() {
        let mut h = harness(MockRemote::default());
        write_local(&h, "a.txt", b"bytes");
        h.engine.initial_sync().await.unwrap();

        h.remote.remove("a.txt");
        let summary = h.engine.run_cycle().await;

        assert_eq!(summary.deleted_local, 1);
        assert!(read_local(&h, "a.txt").is_none());
        assert_eq!(h.engine.tracked_files(), 0);
    }

    #[tokio::test]
    async fn remote_modification_is_downloaded() {
        let remote =
            MockRemote::default().with_file("a.txt", b"v1", "2024-01-01T00:00:00Z");
        let mut h = harness(remote);
        h.engine.initial_sync().await.unwrap();

        h.remote.touch("a.txt", b"v2", "2024-02-02T00:00:00Z");
        let summary = h.engine.run_cycle().await;

        assert_eq!(summary.downloaded, 1);
        assert_eq!(read_local(&h, "a.txt").unwrap(), b"v2");
    }

    #[tokio::test]
    async fn remote_new_file_is_downloaded() {
        let mut h = harness(MockRemote::default());
        h.engine.initial_sync().await.unwrap();

        let remote = h.remote.clone();
        let id = remote.mint_id();
        remote.files.lock().unwrap().insert(
            "new.txt".into(),
            (
                RemoteFile {
                    id,
                    name: "new.txt".into(),
                    mime_type: None,
                    modified: Some("2024-03-03T00:00:00Z".into()),
                    checksum: None,
                    size: Some(3),
                },
                b"abc".to_vec(),
            ),
        );

        let summary = h.engine.run_cycle().await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(read_local(&h, "new.txt").unwrap(), b"abc");
    }

    // ------------------------------------------------------------------
    // Error containment
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn one_failing_upload_does_not_block_others() {
        let mut h = harness(MockRemote::default());
        h.engine.initial_sync().await.unwrap();

        write_local(&h, "bad.txt", b"unlucky");
        write_local(&h, "good.txt", b"lucky");
        h.remote.fail_upload_of("bad.txt");
        h.queue.enqueue(ChangeKind::Created, "bad.txt".into());
        h.queue.enqueue(ChangeKind::Created, "good.txt".into());

        let summary = h.engine.run_cycle().await;

        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("bad.txt"));
        assert!(h.remote.has("good.txt"));
        assert!(!h.remote.has("bad.txt"));
    }

    #[tokio::test]
    async fn failed_upload_is_retried_on_next_cycle() {
        let mut h = harness(MockRemote::default());
        h.engine.initial_sync().await.unwrap();

        write_local(&h, "bad.txt", b"unlucky");
        h.remote.fail_upload_of("bad.txt");
        h.queue.enqueue(ChangeKind::Created, "bad.txt".into());
        let first = h.engine.run_cycle().await;
        assert!(!first.is_clean());
        assert!(!h.queue.is_empty(), "failed upload should be requeued");

        // remote recovers, the requeued change goes through
        h.remote.fail_uploads_for.lock().unwrap().clear();
        let summary = h.engine.run_cycle().await;
        assert_eq!(summary.uploaded, 1);
        assert!(h.remote.has("bad.txt"));
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn shutdown_stops_change_source_before_final_drain() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct FlagSource {
            alive: Arc<AtomicBool>,
        }

        impl IChangeSource for FlagSource {
            fn start(&mut self) -> Result<()> {
                self.alive.store(true, Ordering::SeqCst);
                Ok(())
            }
            fn stop(&mut self) {
                self.alive.store(false, Ordering::SeqCst);
            }
            fn is_alive(&self) -> bool {
                self.alive.load(Ordering::SeqCst)
            }
        }

        let mut h = harness(MockRemote::default());
        let alive = Arc::new(AtomicBool::new(true));
        h.engine = h
            .engine
            .with_change_source(Box::new(FlagSource {
                alive: alive.clone(),
            }));

        let cancel = CancellationToken::new();
        h.engine.cancel = cancel.clone();

        let remote = h.remote.clone();
        let queue = h.queue.clone();
        let root_path = h.root.path().to_path_buf();
        let handle = tokio::spawn(async move {
            h.engine.run().await.unwrap();
            h
        });

        // let the initial reconciliation finish, then queue a late change
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(root_path.join("late.txt"), b"last words").unwrap();
        queue.enqueue(ChangeKind::Created, "late.txt".into());
        cancel.cancel();

        let h = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop after cancellation")
            .unwrap();

        // source stopped, and the queued change still made it out
        assert!(!alive.load(Ordering::SeqCst));
        assert_eq!(remote.content_of("late.txt").unwrap(), b"last words");
        assert_eq!(h.engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let mut h = harness(MockRemote::default());
        let cancel = CancellationToken::new();
        h.engine.cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            h.engine.run().await.unwrap();
            h.engine.state()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let final_state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop after cancellation")
            .unwrap();
        assert_eq!(final_state, EngineState::Stopped);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn mtime_is_positive_for_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert!(local_mtime_secs(&path).unwrap() > 0.0);
    }
}
