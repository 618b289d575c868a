//! Filters deciding which objects a controller instance looks at
use addon_core::{
    cluster::Cluster,
    v1alpha1::{PAUSED_ANNOTATION, WATCH_FILTER_LABEL},
    Resource, ResourceExt,
};

/// Whether reconciliation of the object was suspended through the paused annotation
pub fn is_paused<K: Resource>(obj: &K) -> bool {
    obj.annotations().contains_key(PAUSED_ANNOTATION)
}

/// Whether the object belongs to this controller instance
///
/// Without a configured filter every object does.
pub fn has_filter_label<K: Resource>(obj: &K, watch_filter: Option<&str>) -> bool {
    watch_filter.map_or(true, |value| {
        obj.labels().get(WATCH_FILTER_LABEL).map(String::as_str) == Some(value)
    })
}

/// Objects that are neither paused nor filtered out
pub fn not_paused_and_has_filter_label<K: Resource>(obj: &K, watch_filter: Option<&str>) -> bool {
    !is_paused(obj) && has_filter_label(obj, watch_filter)
}

/// Whether addons of this controller instance may select `cluster`
///
/// Used both when selecting clusters and when mapping cluster events to addons. A paused
/// cluster stays selectable, so relabelling it still moves its instance.
pub fn is_selectable_cluster(cluster: &Cluster, watch_filter: Option<&str>) -> bool {
    has_filter_label(cluster, watch_filter)
}
