//! The externally managed `Cluster` kind
use crate::metadata::ObjectMeta;
use serde::{Deserialize, Serialize};

/// API version of [`Cluster`]
pub const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// A managed member of the fleet
///
/// Owned by whatever provisions clusters, only ever read here.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Cluster {
    /// Standard object metadata, the labels are what addons select on
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired cluster state
    #[serde(default)]
    pub spec: ClusterSpec,
}

/// The part of a cluster's spec the controllers care about
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Reconciliation of everything related to the cluster is suspended
    #[serde(default)]
    pub paused: bool,
}

crate::impl_resource!(Cluster, "Cluster", "cluster.x-k8s.io/v1beta1");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Resource, ResourceExt};

    #[test]
    fn cluster_references_carry_type_information() {
        let cluster = Cluster {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                namespace: Some("ns1".into()),
                uid: Some("uid-1".into()),
                ..Default::default()
            },
            spec: ClusterSpec::default(),
        };
        let reference = cluster.object_ref();
        assert_eq!(reference.kind.as_deref(), Some("Cluster"));
        assert_eq!(reference.api_version.as_deref(), Some(CLUSTER_API_VERSION));
        assert_eq!(reference.to_string(), "ns1/c1");

        let owner = cluster.controller_owner_ref().unwrap();
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
        assert!(!cluster.is_deleting());
    }

    #[test]
    fn unpersisted_objects_have_no_owner_reference() {
        assert!(Cluster::default().controller_owner_ref().is_none());
    }
}
