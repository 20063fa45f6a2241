//! DriveMirror Sync - Bidirectional reconciliation engine
//!
//! Provides:
//! - Periodic pull/push reconciliation cycles against a remote file store
//! - Persisted per-file sync state with crash-safe writes
//! - Coalescing change queue fed by a filesystem watcher
//!
//! ## Modules
//!
//! - [`engine`] - Reconciliation engine orchestrating pull/push cycles
//! - [`state`] - Persisted state document (path -> record)
//! - [`queue`] - Coalescing pending-change sets and the watcher-facing sink
//! - [`watcher`] - Filesystem watcher adapter built on `notify`

pub mod engine;
pub mod queue;
pub mod state;
pub mod watcher;

pub use engine::{CycleSummary, EngineState, SyncEngine};
pub use queue::{ChangeQueue, ChangeRouter, PendingChanges};
pub use state::{StateStoreError, SyncStateStore};
pub use watcher::DirWatcher;
