//! The collaborator that actually puts the GitOps agent onto a cluster
use addon_core::ObjectReference;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// What the installer reported after an `apply`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The agent is running
    Ready,
    /// The agent was accepted but is not up yet
    Installing,
    /// The agent cannot be installed, with the installer's reason
    Failed(String),
}

/// What the installer reported after a `remove`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Nothing of the agent is left on the cluster
    Removed,
    /// The agent could not be removed, with the installer's reason
    Failed(String),
}

/// Transient installer failures, always retried
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InstallerError {
    /// The call was cancelled after running into the deadline
    #[error("installer did not answer within {0:?}")]
    Timeout(Duration),
    /// The installer could not be reached
    #[error("installer unavailable: {0}")]
    Unavailable(String),
}

/// Installs and removes the agent on a cluster
///
/// Both calls must be idempotent. Dropping the returned future cancels the call.
#[async_trait]
pub trait Installer: Send + Sync + 'static {
    /// Make sure the agent bootstrapped from `source` runs on `cluster`
    async fn apply(&self, cluster: &ObjectReference, source: &str) -> Result<InstallOutcome, InstallerError>;

    /// Make sure no agent bootstrapped from `source` is left on `cluster`
    async fn remove(&self, cluster: &ObjectReference, source: &str) -> Result<RemoveOutcome, InstallerError>;
}

/// Calls [`Installer::apply`], giving up after `timeout`
pub async fn apply(
    installer: &dyn Installer,
    timeout: Duration,
    cluster: &ObjectReference,
    source: &str,
) -> Result<InstallOutcome, InstallerError> {
    tokio::time::timeout(timeout, installer.apply(cluster, source))
        .await
        .map_err(|_| InstallerError::Timeout(timeout))?
}

/// Calls [`Installer::remove`], giving up after `timeout`
pub async fn remove(
    installer: &dyn Installer,
    timeout: Duration,
    cluster: &ObjectReference,
    source: &str,
) -> Result<RemoveOutcome, InstallerError> {
    tokio::time::timeout(timeout, installer.remove(cluster, source))
        .await
        .map_err(|_| InstallerError::Timeout(timeout))?
}

/// An installer that only logs, and reports every request as done
///
/// Backs the standalone binary, where there are no real clusters to install to.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInstaller;

#[async_trait]
impl Installer for NoopInstaller {
    async fn apply(&self, cluster: &ObjectReference, source: &str) -> Result<InstallOutcome, InstallerError> {
        info!(%cluster, source, "would install agent");
        Ok(InstallOutcome::Ready)
    }

    async fn remove(&self, cluster: &ObjectReference, source: &str) -> Result<RemoveOutcome, InstallerError> {
        info!(%cluster, source, "would remove agent");
        Ok(RemoveOutcome::Removed)
    }
}
