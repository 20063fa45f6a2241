//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the trait boundaries the engine depends on; their
//! implementations live in adapter crates.
//!
//! - [`IRemoteStore`] - Remote file store operations (Google Drive adapter)
//! - [`IChangeSource`] / [`IChangeSink`] - Local change detection and delivery

pub mod change_source;
pub mod remote_store;

pub use change_source::{IChangeSink, IChangeSource};
pub use remote_store::{IRemoteStore, RemoteFile};
