//! DriveMirror Core - Domain types and port definitions
//!
//! This crate holds everything the rest of the workspace depends on but that
//! depends on nothing else in the workspace:
//!
//! - [`domain`] - The persisted record model and validated identifiers
//! - [`ports`] - Trait boundaries for the remote store and the local change source
//! - [`config`] - Typed YAML configuration with validation and a builder
//!
//! Adapter crates (`drivemirror-drive`, the watcher in `drivemirror-sync`)
//! implement the ports; the reconciliation engine consumes them as trait
//! objects so tests can substitute in-memory doubles.

pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{ChangeKind, FileRecord, RecordPatch, RemoteId};
pub use ports::{IChangeSink, IChangeSource, IRemoteStore, RemoteFile};
