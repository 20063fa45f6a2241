//! Local change source port (driving/primary port)
//!
//! A change source watches the sync root and delivers
//! `(kind, absolute path)` pairs into an [`IChangeSink`]. The sink is a
//! single-method trait rather than a registered callback function so a test
//! can hand the watcher (or the engine) a double and inject events
//! synchronously.
//!
//! ## Threading
//!
//! Sink notifications may arrive on the watcher's own thread. Sink
//! implementations must be thread-safe and must return quickly: the contract
//! is "record that this path changed", never I/O.

use std::path::PathBuf;

use crate::domain::record::ChangeKind;

/// Receiver for local filesystem change notifications
pub trait IChangeSink: Send + Sync {
    /// Called once per observed change with the absolute path involved
    fn notify(&self, kind: ChangeKind, path: PathBuf);
}

/// Port trait for a local directory watcher
///
/// Implementations are constructed with a root path and a sink, and must
/// filter out hidden files, temporary-file suffixes, and the engine's own
/// state file before notifying, so the engine never syncs its own
/// bookkeeping back to the remote.
pub trait IChangeSource: Send {
    /// Starts delivering change notifications
    fn start(&mut self) -> anyhow::Result<()>;

    /// Stops the watcher; no notifications are delivered after this returns
    fn stop(&mut self);

    /// Returns whether the watcher is currently delivering notifications
    fn is_alive(&self) -> bool;
}
