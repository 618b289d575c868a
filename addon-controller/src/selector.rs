//! Resolving an addon's cluster selector against the cluster registry
use crate::{predicates, Error, Result};
use addon_client::{Api, Client};
use addon_core::{cluster::Cluster, LabelSelector, ListParams, ObjectReference, Resource, ResourceExt, Selector};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Read-only access to the clusters of a namespace
#[async_trait]
pub trait ClusterRegistry: Send + Sync + 'static {
    /// All clusters in `namespace`, with their labels
    async fn list(&self, namespace: &str) -> addon_client::Result<Vec<Cluster>>;
}

/// A [`ClusterRegistry`] reading straight from the object store
#[derive(Clone, Debug)]
pub struct StoreRegistry {
    client: Client,
}

impl StoreRegistry {
    /// Read clusters through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterRegistry for StoreRegistry {
    async fn list(&self, namespace: &str) -> addon_client::Result<Vec<Cluster>> {
        Api::<Cluster>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
    }
}

/// The clusters in `namespace` that carry every label `selector` requires
///
/// An empty selector matches every cluster of the namespace. Clusters from other namespaces
/// never match, and neither do clusters outside `watch_filter`.
pub fn matching_clusters(
    namespace: &str,
    selector: &Selector,
    watch_filter: Option<&str>,
    clusters: &[Cluster],
) -> BTreeSet<ObjectReference> {
    clusters
        .iter()
        .filter(|c| c.meta().namespace.as_deref() == Some(namespace))
        .filter(|c| predicates::is_selectable_cluster(c, watch_filter))
        .filter(|c| selector.matches(c.labels()))
        .map(Resource::object_ref)
        .collect()
}

/// Validate `selector`, then match it against the clusters of `namespace` in `registry`
///
/// # Errors
///
/// [`Error::InvalidSelector`] for malformed keys or values, [`Error::ClusterList`] when the
/// registry cannot be listed.
pub async fn select_clusters(
    registry: &dyn ClusterRegistry,
    namespace: &str,
    selector: &LabelSelector,
    watch_filter: Option<&str>,
) -> Result<BTreeSet<ObjectReference>> {
    let selector = Selector::from(selector);
    selector.validate()?;
    let clusters = registry.list(namespace).await.map_err(Error::ClusterList)?;
    Ok(matching_clusters(namespace, &selector, watch_filter, &clusters))
}
