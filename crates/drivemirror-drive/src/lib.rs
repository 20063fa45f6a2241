//! DriveMirror Drive - Google Drive v3 adapter
//!
//! Provides:
//! - [`client`] - Typed HTTP client for the Drive v3 REST API
//! - [`store`] - [`IRemoteStore`](drivemirror_core::ports::IRemoteStore)
//!   implementation backed by the client

pub mod client;
pub mod store;

pub use client::{DriveClient, DriveError, DriveFile};
pub use store::DriveRemoteStore;
