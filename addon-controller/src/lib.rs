//! Keeps a GitOps agent installed on exactly the clusters a `FluxAddon` selects
//!
//! Two controllers cooperate:
//!
//! - the [`addon`] controller resolves each addon's cluster selector, creates one
//!   `FluxAddonInstance` per matching cluster, deletes the instances of clusters that stopped
//!   matching and folds the health of its instances into the addon status;
//! - the [`instance`] controller drives the [`Installer`] for one (addon, cluster) pair and
//!   removes the agent again before an instance may go away.
//!
//! Cluster events reach the addon controller through the [`mapper`], instance events through
//! owner references. [`manager::run`] wires both together.
#![deny(missing_docs)]

pub mod addon;
pub mod config;
pub mod error;
pub mod installer;
pub mod instance;
pub mod manager;
pub mod manifest;
pub mod mapper;
pub mod predicates;
pub mod selector;
pub mod telemetry;

pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use installer::{InstallOutcome, Installer, InstallerError, NoopInstaller, RemoveOutcome};
pub use selector::{ClusterRegistry, StoreRegistry};

use addon_client::Client;
use std::sync::Arc;

/// Everything the reconcilers need, passed to every reconcile call
#[derive(Clone)]
pub struct Context {
    /// Store access
    pub client: Client,
    /// Where clusters are looked up for selection
    pub registry: Arc<dyn ClusterRegistry>,
    /// Puts the agent onto clusters
    pub installer: Arc<dyn Installer>,
    /// Timeouts, intervals and filters
    pub config: ControllerConfig,
}

impl Context {
    /// A context that reads clusters from the same store the addons live in
    pub fn new(client: Client, installer: Arc<dyn Installer>, config: ControllerConfig) -> Self {
        Self {
            registry: Arc::new(StoreRegistry::new(client.clone())),
            client,
            installer,
            config,
        }
    }

    /// Replace the cluster registry
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn ClusterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub(crate) fn watch_filter(&self) -> Option<&str> {
        self.config.watch_filter.as_deref()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("client", &self.client)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
