//! Error handling in [`addon_client`][crate]
use thiserror::Error;

/// Possible errors when talking to the object store
#[derive(Error, Debug)]
pub enum Error {
    /// The object does not exist, or no longer exists
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// An object with the same name already exists
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Kind of the existing object
        kind: String,
        /// Name of the existing object
        name: String,
    },

    /// The write carried a stale resourceVersion
    #[error("conflict writing {kind} {name:?}: {message}")]
    Conflict {
        /// Kind of the written object
        kind: String,
        /// Name of the written object
        name: String,
        /// Why the store refused the write
        message: String,
    },

    /// The store refused the object as malformed
    #[error("invalid object: {0}")]
    Invalid(String),

    /// The store could not be reached, retrying later may succeed
    #[error("object store unavailable: {0}")]
    Unavailable(String),

    /// Common error case when requesting parsing into own structs
    #[error("Error deserializing response: {0}")]
    SerdeError(#[source] serde_json::Error),

    /// A stored object did not convert into the requested type
    #[error("Error converting object: {0}")]
    Conversion(#[from] addon_core::dynamic::ParseDynamicObjectError),
}

impl Error {
    /// Whether the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether the write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Whether the same request may succeed later without changes
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Conflict { .. })
    }
}
