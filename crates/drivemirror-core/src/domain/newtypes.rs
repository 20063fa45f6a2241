//! Validated identifier newtypes
//!
//! Wrapping the raw strings the remote API hands back keeps "any string" out
//! of function signatures: a [`RemoteId`] in a signature is guaranteed
//! non-empty from construction onward.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing a domain newtype from invalid input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NewtypeError {
    /// The identifier string was empty
    #[error("remote id must not be empty")]
    EmptyRemoteId,
}

// ============================================================================
// RemoteId
// ============================================================================

/// Opaque identifier assigned to a file by the remote store
///
/// The value is never interpreted; it is only stored, compared for equality,
/// and echoed back to the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Creates a `RemoteId`, rejecting empty strings
    pub fn new(id: impl Into<String>) -> Result<Self, NewtypeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(NewtypeError::EmptyRemoteId);
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
