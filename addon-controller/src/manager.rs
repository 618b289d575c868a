//! Runs the addon and instance controllers side by side
use crate::{addon, instance, mapper, Context};
use addon_client::Api;
use addon_core::{
    cluster::Cluster,
    v1alpha1::{FluxAddon, FluxAddonInstance},
    ListParams, Resource,
};
use addon_runtime::{
    controller::{self, Action},
    reflector::ObjectRef,
    watcher, Controller,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drive both controllers until `shutdown` is cancelled
///
/// The addon controller is triggered by addons, by the instances they own, and by every
/// cluster event in their namespace. The instance controller only follows instances.
/// With `namespace` configured both only see that namespace.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let client = ctx.client.clone();
    let (addons, instances, clusters) = match ctx.config.namespace.as_deref() {
        Some(ns) => (
            Api::<FluxAddon>::namespaced(client.clone(), ns),
            Api::<FluxAddonInstance>::namespaced(client.clone(), ns),
            Api::<Cluster>::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone()), Api::all(client)),
    };
    info!(namespace = ?ctx.config.namespace, watch_filter = ?ctx.config.watch_filter, "starting controllers");

    let addon_controller = Controller::new(addons, ListParams::default()).with_config(ctx.config.runtime_config());
    let cache = addon_controller.store();
    let watch_filter = ctx.config.watch_filter.clone();
    let addon_controller = addon_controller
        .owns(instances.clone(), ListParams::default())
        .watches(clusters, ListParams::default(), move |cluster| {
            mapper::cluster_to_addons(&cache, watch_filter.as_deref(), &cluster)
        })
        .shutdown_on(cancelled(shutdown.clone()))
        .run(addon::reconcile, addon::error_policy, ctx.clone())
        .for_each(|outcome| async move { log_outcome(outcome) });

    let instance_controller = Controller::new(instances, ListParams::default())
        .with_config(ctx.config.runtime_config())
        .shutdown_on(cancelled(shutdown))
        .run(instance::reconcile, instance::error_policy, ctx)
        .for_each(|outcome| async move { log_outcome(outcome) });

    futures::join!(addon_controller, instance_controller);
    info!("controllers stopped");
}

async fn cancelled(token: CancellationToken) {
    token.cancelled().await;
}

fn log_outcome<K: Resource>(
    outcome: Result<(ObjectRef<K>, Action), controller::Error<crate::Error, watcher::Error>>,
) {
    match outcome {
        Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
        Err(controller::Error::ReconcilerFailed(err, obj)) => {
            debug!(object = %obj, reason = err.reason(), "reconcile will be retried");
        }
        Err(err) => warn!(kind = K::KIND, error = ?err, "controller error"),
    }
}
