//! Turning cluster events into addon reconcile requests
use crate::predicates;
use addon_core::{cluster::Cluster, v1alpha1::FluxAddon, Resource};
use addon_runtime::reflector::{ObjectRef, Store};

/// Every addon in the namespace of `cluster` that could select it
///
/// Membership is recomputed from scratch by the addon reconciler, so the label diff of the
/// event is not needed: any change to a cluster re-enqueues all addons of its namespace.
/// Clusters no addon may select trigger nothing, and neither do paused or filtered addons.
pub fn cluster_to_addons(
    addons: &Store<FluxAddon>,
    watch_filter: Option<&str>,
    cluster: &Cluster,
) -> Vec<ObjectRef<FluxAddon>> {
    if !predicates::is_selectable_cluster(cluster, watch_filter) {
        return Vec::new();
    }
    let namespace = cluster.meta().namespace.as_deref();
    let mut refs: Vec<_> = addons
        .state()
        .iter()
        .filter(|addon| addon.meta().namespace.as_deref() == namespace)
        .filter(|addon| predicates::not_paused_and_has_filter_label(addon.as_ref(), watch_filter))
        .map(|addon| ObjectRef::from_obj(addon.as_ref()))
        .collect();
    refs.sort_by(|a, b| a.name.cmp(&b.name));
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_core::{
        v1alpha1::{PAUSED_ANNOTATION, WATCH_FILTER_LABEL},
        ObjectMeta,
    };
    use addon_runtime::{reflector::store, watcher};

    fn meta(name: &str, ns: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            ..Default::default()
        }
    }

    fn addon(name: &str, ns: &str) -> FluxAddon {
        FluxAddon {
            metadata: meta(name, ns),
            ..Default::default()
        }
    }

    fn cluster(name: &str, ns: &str) -> Cluster {
        Cluster {
            metadata: meta(name, ns),
            ..Default::default()
        }
    }

    fn names(refs: &[ObjectRef<FluxAddon>]) -> Vec<&str> {
        refs.iter().map(|r| r.name.as_str()).collect()
    }

    fn cache(addons: Vec<FluxAddon>) -> Store<FluxAddon> {
        let (reader, mut writer) = store();
        writer.apply_watcher_event(&watcher::Event::Restarted(addons));
        reader
    }

    #[test]
    fn enqueues_every_addon_of_the_namespace() {
        let addons = cache(vec![addon("flux-b", "ns1"), addon("flux-a", "ns1"), addon("flux-c", "ns2")]);
        let refs = cluster_to_addons(&addons, None, &cluster("c1", "ns1"));
        assert_eq!(names(&refs), vec!["flux-a", "flux-b"]);
        assert!(refs.iter().all(|r| r.namespace.as_deref() == Some("ns1")));
        assert!(cluster_to_addons(&addons, None, &cluster("c1", "ns3")).is_empty());
    }

    #[test]
    fn paused_addons_are_not_enqueued() {
        let mut paused_addon = addon("flux-b", "ns1");
        paused_addon.metadata.annotations.insert(PAUSED_ANNOTATION.into(), "true".into());
        let addons = cache(vec![addon("flux-a", "ns1"), paused_addon]);
        assert_eq!(names(&cluster_to_addons(&addons, None, &cluster("c1", "ns1"))), vec!["flux-a"]);
    }

    #[test]
    fn paused_clusters_still_enqueue_their_addons() {
        // paused clusters are still selected
        let addons = cache(vec![addon("flux-a", "ns1")]);
        let mut paused = cluster("c1", "ns1");
        paused.spec.paused = true;
        paused.metadata.annotations.insert(PAUSED_ANNOTATION.into(), "true".into());
        assert_eq!(names(&cluster_to_addons(&addons, None, &paused)), vec!["flux-a"]);
    }

    #[test]
    fn watch_filter_applies_to_both_sides() {
        let mut labelled = addon("flux-a", "ns1");
        labelled.metadata.labels.insert(WATCH_FILTER_LABEL.into(), "team-a".into());
        let addons = cache(vec![labelled, addon("flux-b", "ns1")]);

        let mut c1 = cluster("c1", "ns1");
        assert!(cluster_to_addons(&addons, Some("team-a"), &c1).is_empty());
        c1.metadata.labels.insert(WATCH_FILTER_LABEL.into(), "team-a".into());
        assert_eq!(names(&cluster_to_addons(&addons, Some("team-a"), &c1)), vec!["flux-a"]);
    }
}
