//! Error handling in [`addon_controller`][crate]
use crate::installer::InstallerError;
use addon_core::labels::SelectorError;
use thiserror::Error;

/// Failures of a single reconcile pass
///
/// Every variant is scoped to the object being reconciled, the controllers retry it with backoff.
#[derive(Error, Debug)]
pub enum Error {
    /// A store request failed
    #[error("object store request failed: {0}")]
    Store(#[from] addon_client::Error),

    /// The addon's cluster selector is malformed
    #[error("invalid cluster selector: {0}")]
    InvalidSelector(#[from] SelectorError),

    /// The cluster registry could not be listed
    #[error("failed to list clusters: {0}")]
    ClusterList(#[source] addon_client::Error),

    /// Creating, updating or deleting instances failed
    #[error("failed to reconcile instances: {0}")]
    Instances(#[source] addon_client::Error),

    /// The instance name derived for a cluster belongs to an object owned by someone else
    #[error("instance {0:?} already exists and is not owned by this addon")]
    InstanceNameTaken(String),

    /// The installer could not be reached, or did not answer in time
    #[error("installer call failed: {0}")]
    Installer(#[from] InstallerError),

    /// The installer reported that the agent could not be installed
    #[error("agent installation failed: {0}")]
    InstallFailed(String),

    /// The installer reported that the agent could not be removed
    #[error("agent removal failed: {0}")]
    RemoveFailed(String),

    /// Managing the instance finalizer failed
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<addon_runtime::finalizer::Error<Error>>),

    /// A required field was missing from an object
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Short machine readable reason, used for log fields
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Store(_) => "StoreError",
            Error::InvalidSelector(_) => "InvalidSelector",
            Error::ClusterList(_) => "ClusterListFailed",
            Error::Instances(_) | Error::InstanceNameTaken(_) => "InstanceReconcileFailed",
            Error::Installer(_) => "InstallerUnavailable",
            Error::InstallFailed(_) => "InstallFailed",
            Error::RemoveFailed(_) => "RemoveFailed",
            Error::Finalizer(_) => "FinalizerError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
        }
    }
}

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
