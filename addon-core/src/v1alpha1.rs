//! The `addons.cluster.x-k8s.io/v1alpha1` kinds
use crate::{
    conditions::Condition, labels::LabelSelector, metadata::ObjectMeta, object::ObjectReference,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer held by a [`FluxAddon`] while it still owns instances
pub const FLUX_ADDON_FINALIZER: &str = "flux.addons.cluster.x-k8s.io";

/// Finalizer held by a [`FluxAddonInstance`] until the agent was removed from its cluster
pub const FLUX_ADDON_INSTANCE_FINALIZER: &str = "fluxinstance.addons.cluster.x-k8s.io";

/// Label put on every instance, naming the addon that owns it
pub const FLUX_ADDON_LABEL: &str = "addons.cluster.x-k8s.io/fluxaddon-name";

/// Annotation that suspends reconciliation of an object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Label restricting which objects a controller instance is responsible for
pub const WATCH_FILTER_LABEL: &str = "cluster.x-k8s.io/watch-filter";

/// Condition set on an addon once its selector was evaluated
pub const CLUSTERS_SELECTED: &str = "ClustersSelected";
/// Condition set on an addon once its instances match the selected clusters
pub const INSTANCES_RECONCILED: &str = "InstancesReconciled";
/// Condition set on an addon when all of its instances report ready
pub const INSTANCES_READY: &str = "InstancesReady";
/// Condition set on an instance once the agent is running on its cluster
pub const AGENT_INSTALLED: &str = "AgentInstalled";

/// Declares that the GitOps agent should run on every selected cluster
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FluxAddon {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// User owned desired state
    pub spec: FluxAddonSpec,
    /// Controller owned observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FluxAddonStatus>,
}

/// Desired state of a [`FluxAddon`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxAddonSpec {
    /// Selects clusters in the addon's namespace, an empty selector selects all of them
    #[serde(default)]
    pub cluster_selector: LabelSelector,
    /// Installation source the agent is bootstrapped from
    #[serde(default)]
    pub repository_name: String,
}

/// Observed state of a [`FluxAddon`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxAddonStatus {
    /// Health signals, the summary `Ready` condition first
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Clusters the selector matched on the last pass, sorted
    #[serde(default)]
    pub matching_clusters: Vec<ObjectReference>,
    /// The `metadata.generation` the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Tracks the agent installation on one cluster on behalf of one [`FluxAddon`]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FluxAddonInstance {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state, written by the addon reconciler
    pub spec: FluxAddonInstanceSpec,
    /// Observed state, written by the instance reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FluxAddonInstanceStatus>,
}

/// Desired state of a [`FluxAddonInstance`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxAddonInstanceSpec {
    /// The cluster the agent is installed on
    pub cluster_ref: ObjectReference,
    /// Installation source, copied from the owning addon
    #[serde(default)]
    pub repo_name: String,
}

/// Observed state of a [`FluxAddonInstance`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxAddonInstanceStatus {
    /// Health signals, the summary `Ready` condition first
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Coarse installation state
    #[serde(default)]
    pub status: InstanceState,
    /// The `metadata.generation` the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Coarse installation state of an instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum InstanceState {
    /// Not attempted yet, or the installer could not be reached
    #[default]
    Pending,
    /// The installer accepted the request, the agent is not up yet
    Installing,
    /// The agent is running
    Ready,
    /// The installer reported a failure
    Failed,
    /// Removal from the cluster is in progress
    Deleting,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

crate::impl_resource!(FluxAddon, "FluxAddon", "addons.cluster.x-k8s.io/v1alpha1");
crate::impl_resource!(
    FluxAddonInstance,
    "FluxAddonInstance",
    "addons.cluster.x-k8s.io/v1alpha1"
);

impl FluxAddon {
    /// Conditions from the status, empty before the first status write
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}

impl FluxAddonInstance {
    /// Conditions from the status, empty before the first status write
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    /// The coarse state, `Pending` before the first status write
    pub fn state(&self) -> InstanceState {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }
}
