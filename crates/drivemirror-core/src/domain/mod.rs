//! Domain model
//!
//! The domain is intentionally small: one record type describing the last
//! synced correspondence between a local path and a remote file, plus the
//! validated identifier newtype and the change-event kind shared by the
//! watcher and the engine.

pub mod newtypes;
pub mod record;

pub use newtypes::RemoteId;
pub use record::{ChangeKind, FileRecord, RecordPatch};
