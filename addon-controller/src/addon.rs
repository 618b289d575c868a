//! Reconciler for `FluxAddon`: one instance per selected cluster, and a summary of their health
use crate::{predicates, selector, Context, Error, Result};
use addon_client::Api;
use addon_core::{
    conditions::{self, Condition, Severity, READY},
    v1alpha1::{
        FluxAddon, FluxAddonInstance, FluxAddonInstanceSpec, CLUSTERS_SELECTED, FLUX_ADDON_FINALIZER,
        FLUX_ADDON_INSTANCE_FINALIZER, FLUX_ADDON_LABEL, INSTANCES_READY, INSTANCES_RECONCILED,
        WATCH_FILTER_LABEL,
    },
    ListParams, ObjectMeta, ObjectReference, Resource, ResourceExt, Selector,
};
use addon_runtime::{
    controller::Action,
    finalizer::{ensure_finalizer, remove_finalizer},
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Name of the instance that tracks `cluster` on behalf of `addon`
///
/// The digest suffix keeps pairs like (`a`, `b-c`) and (`a-b`, `c`) apart.
pub fn instance_name(addon: &str, cluster: &str) -> String {
    // '/' never occurs in object names, so every pair hashes a distinct input
    let digest = Sha256::digest(format!("{addon}/{cluster}"));
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{addon}-{cluster}-{suffix}")
}

fn filter_label<K: Resource>(obj: &K) -> Option<&String> {
    obj.labels().get(WATCH_FILTER_LABEL)
}

/// Give `instance` the watch-filter label of `addon`, so both are handled by the same controller
fn inherit_filter_label(addon: &FluxAddon, instance: &mut FluxAddonInstance) {
    match filter_label(addon) {
        Some(value) => {
            instance.labels_mut().insert(WATCH_FILTER_LABEL.to_string(), value.clone());
        }
        None => {
            instance.labels_mut().remove(WATCH_FILTER_LABEL);
        }
    }
}

fn cluster_key(cluster: &ObjectReference) -> (Option<&str>, &str) {
    (cluster.namespace.as_deref(), cluster.name.as_str())
}

/// Changes that bring the instances of an addon in line with its selected clusters
#[derive(Debug, Default, PartialEq)]
pub struct Plan {
    /// Selected clusters without an instance
    pub create: Vec<ObjectReference>,
    /// Instances whose installation source or watch-filter label differs from the addon's
    pub update: Vec<FluxAddonInstance>,
    /// Instances of clusters that are no longer selected
    pub delete: Vec<FluxAddonInstance>,
}

impl Plan {
    /// Whether the instances are already converged
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff the selected clusters against the instances `addon` owns
///
/// Instances that are already being deleted are left alone, they are replaced once they are gone.
pub fn plan(addon: &FluxAddon, desired: &BTreeSet<ObjectReference>, owned: &[FluxAddonInstance]) -> Plan {
    let existing: BTreeSet<_> = owned.iter().map(|i| cluster_key(&i.spec.cluster_ref)).collect();
    let wanted: BTreeSet<_> = desired.iter().map(cluster_key).collect();

    let mut plan = Plan {
        create: desired
            .iter()
            .filter(|cluster| !existing.contains(&cluster_key(cluster)))
            .cloned()
            .collect(),
        ..Plan::default()
    };
    for instance in owned.iter().filter(|i| !i.is_deleting()) {
        if !wanted.contains(&cluster_key(&instance.spec.cluster_ref)) {
            plan.delete.push(instance.clone());
        } else if instance.spec.repo_name != addon.spec.repository_name
            || filter_label(instance) != filter_label(addon)
        {
            plan.update.push(instance.clone());
        }
    }
    plan
}

/// The instance `addon` wants for `cluster`, before it is created
pub fn new_instance(addon: &FluxAddon, cluster: &ObjectReference) -> Result<FluxAddonInstance> {
    let addon_name = addon.meta().name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let owner = addon
        .controller_owner_ref()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let mut instance = FluxAddonInstance {
        metadata: ObjectMeta {
            name: Some(instance_name(&addon_name, &cluster.name)),
            namespace: addon.namespace(),
            labels: BTreeMap::from([(FLUX_ADDON_LABEL.to_string(), addon_name)]),
            // held from the start, so the agent is removed even if the instance is deleted early
            finalizers: vec![FLUX_ADDON_INSTANCE_FINALIZER.to_string()],
            owner_references: vec![owner],
            ..ObjectMeta::default()
        },
        spec: FluxAddonInstanceSpec {
            cluster_ref: cluster.clone(),
            repo_name: addon.spec.repository_name.clone(),
        },
        status: None,
    };
    inherit_filter_label(addon, &mut instance);
    Ok(instance)
}

/// Fold the health of the instances into the `InstancesReady` condition
///
/// Failed instances take precedence over instances that are merely not ready yet.
pub fn instances_ready(instances: &[FluxAddonInstance]) -> Condition {
    fn sorted_names<'a>(instances: impl Iterator<Item = &'a FluxAddonInstance>) -> Vec<String> {
        let mut names: Vec<String> = instances.map(ResourceExt::name_any).collect();
        names.sort();
        names
    }
    let failed = sorted_names(instances.iter().filter(|i| {
        conditions::get(i.conditions(), READY).is_some_and(|c| c.is_false_with(Severity::Error))
    }));
    if !failed.is_empty() {
        return Condition::falsy(
            INSTANCES_READY,
            Severity::Error,
            "InstanceFailed",
            format!("instances failed: {}", failed.join(", ")),
        );
    }
    let pending = sorted_names(instances.iter().filter(|i| !conditions::is_true(i.conditions(), READY)));
    if !pending.is_empty() {
        return Condition::falsy(
            INSTANCES_READY,
            Severity::Warning,
            "InstancesNotReady",
            format!("instances not ready: {}", pending.join(", ")),
        );
    }
    Condition::truthy(INSTANCES_READY)
}

/// What a pass learned, written to the status on the way out
#[derive(Debug, Default)]
struct Observation {
    matching_clusters: Option<Vec<ObjectReference>>,
    conditions: Vec<Condition>,
    ready_override: Option<Condition>,
}

impl Observation {
    fn instances_failed(&mut self, err: &dyn std::error::Error) {
        self.conditions.push(Condition::falsy(
            INSTANCES_RECONCILED,
            Severity::Warning,
            "InstanceReconcileFailed",
            err.to_string(),
        ));
    }
}

/// Controller triggers this whenever an addon, one of its instances or a cluster in its namespace changed
pub async fn reconcile(addon: Arc<FluxAddon>, ctx: Arc<Context>) -> Result<Action> {
    if !predicates::not_paused_and_has_filter_label(addon.as_ref(), ctx.watch_filter()) {
        debug!(addon = %addon.name_any(), "paused or filtered out, skipping");
        return Ok(Action::await_change());
    }
    let namespace = addon.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let addons: Api<FluxAddon> = Api::namespaced(ctx.client.clone(), &namespace);
    let instances: Api<FluxAddonInstance> = Api::namespaced(ctx.client.clone(), &namespace);
    let retries = ctx.config.conflict_retries;

    if addon.is_deleting() {
        return cleanup(addon, &addons, &instances, &ctx).await;
    }

    // The finalizer goes first, created instances must never outlive a vanished addon
    let addon = if addon.finalizers().iter().any(|f| f == FLUX_ADDON_FINALIZER) {
        addon
    } else {
        Arc::new(ensure_finalizer(&addons, &*addon, FLUX_ADDON_FINALIZER, retries).await?)
    };

    let mut observation = Observation::default();
    let result = converge(&addon, &namespace, &instances, &ctx, &mut observation)
        .await
        .map(|()| Action::requeue(ctx.config.resync_period.as_std()));
    let written = write_status(&addons, &addon, &observation, retries).await;
    finish(&addon, result, written)
}

/// The controller triggers this on reconcile errors
pub fn error_policy(addon: Arc<FluxAddon>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        addon = %addon.name_any(),
        namespace = addon.meta().namespace.as_deref().unwrap_or_default(),
        reason = error.reason(),
        %error,
        "reconcile failed"
    );
    Action::backoff()
}

async fn converge(
    addon: &FluxAddon,
    namespace: &str,
    instances: &Api<FluxAddonInstance>,
    ctx: &Context,
    observation: &mut Observation,
) -> Result<()> {
    let selected = selector::select_clusters(
        ctx.registry.as_ref(),
        namespace,
        &addon.spec.cluster_selector,
        ctx.watch_filter(),
    )
    .await;
    let desired = match selected {
        Ok(desired) => desired,
        Err(err) => {
            let severity = match err {
                Error::InvalidSelector(_) => Severity::Error,
                _ => Severity::Warning,
            };
            observation.conditions.push(Condition::falsy(
                CLUSTERS_SELECTED,
                severity,
                err.reason(),
                err.to_string(),
            ));
            return Err(err);
        }
    };
    observation.conditions.push(Condition::truthy(CLUSTERS_SELECTED));
    observation.matching_clusters = Some(desired.iter().cloned().collect());

    let owned = match owned_instances(instances, addon).await {
        Ok(owned) => owned,
        Err(err) => {
            observation.instances_failed(&err);
            return Err(Error::Instances(err));
        }
    };

    let plan = plan(addon, &desired, &owned);
    if plan.is_empty() {
        debug!(addon = %addon.name_any(), instances = owned.len(), "instances up to date");
    }
    let mut failure = None;
    let mut current: Vec<FluxAddonInstance> = owned
        .into_iter()
        .filter(|i| !plan.delete.iter().any(|d| d.meta().name == i.meta().name))
        .collect();

    for cluster in &plan.create {
        match create_instance(addon, cluster, instances).await {
            Ok(instance) => current.push(instance),
            Err(err) => {
                warn!(addon = %addon.name_any(), %cluster, %err, "failed to create instance");
                failure.get_or_insert(err);
            }
        }
    }
    for instance in &plan.update {
        let updated = instances
            .modify(instance, ctx.config.conflict_retries, |i| {
                i.spec.repo_name.clone_from(&addon.spec.repository_name);
                inherit_filter_label(addon, i);
            })
            .await;
        match updated {
            Ok(updated) => {
                info!(addon = %addon.name_any(), instance = %updated.name_any(), repo = %updated.spec.repo_name, "updated instance");
                if let Some(slot) = current.iter_mut().find(|i| i.meta().name == updated.meta().name) {
                    *slot = updated;
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(addon = %addon.name_any(), instance = %instance.name_any(), %err, "failed to update instance");
                failure.get_or_insert(Error::Instances(err));
            }
        }
    }
    for instance in &plan.delete {
        if let Err(err) = delete_instance(instances, instance).await {
            warn!(addon = %addon.name_any(), instance = %instance.name_any(), %err, "failed to delete instance");
            failure.get_or_insert(Error::Instances(err));
        }
    }

    match &failure {
        Some(err) => observation.instances_failed(err),
        None => observation.conditions.push(Condition::truthy(INSTANCES_RECONCILED)),
    }
    observation.conditions.push(instances_ready(&current));
    failure.map_or(Ok(()), Err)
}

async fn cleanup(
    addon: Arc<FluxAddon>,
    addons: &Api<FluxAddon>,
    instances: &Api<FluxAddonInstance>,
    ctx: &Context,
) -> Result<Action> {
    let mut observation = Observation::default();
    let result = match owned_instances(instances, &addon).await {
        Err(err) => {
            observation.instances_failed(&err);
            Err(Error::Instances(err))
        }
        Ok(owned) if owned.is_empty() => {
            remove_finalizer(addons, &*addon, FLUX_ADDON_FINALIZER, ctx.config.conflict_retries).await?;
            info!(addon = %addon.name_any(), "no instances left, released addon");
            return Ok(Action::await_change());
        }
        Ok(owned) => {
            let mut failure = None;
            for instance in owned.iter().filter(|i| !i.is_deleting()) {
                if let Err(err) = delete_instance(instances, instance).await {
                    failure.get_or_insert(err);
                }
            }
            observation.ready_override = Some(Condition::falsy(
                READY,
                Severity::Warning,
                "Deleting",
                format!("waiting for {} instances to be removed", owned.len()),
            ));
            match failure {
                Some(err) => {
                    observation.instances_failed(&err);
                    Err(Error::Instances(err))
                }
                None => Ok(Action::requeue(ctx.config.cleanup_poll_interval.as_std())),
            }
        }
    };
    let written = write_status(addons, &addon, &observation, ctx.config.conflict_retries).await;
    finish(&addon, result, written)
}

/// The instances listing `addon` as their owner
async fn owned_instances(
    api: &Api<FluxAddonInstance>,
    addon: &FluxAddon,
) -> addon_client::Result<Vec<FluxAddonInstance>> {
    let selector = Selector::default().with(FLUX_ADDON_LABEL, addon.name_any());
    let instances = api.list(&ListParams::default().labels_from(&selector)).await?;
    Ok(instances.into_iter().filter(|i| i.is_owned_by(addon)).collect())
}

async fn create_instance(
    addon: &FluxAddon,
    cluster: &ObjectReference,
    api: &Api<FluxAddonInstance>,
) -> Result<FluxAddonInstance> {
    let instance = new_instance(addon, cluster)?;
    let name = instance.name_any();
    match api.create(&instance).await {
        Ok(created) => {
            info!(addon = %addon.name_any(), instance = %name, %cluster, "created instance");
            Ok(created)
        }
        Err(addon_client::Error::AlreadyExists { .. }) => {
            // the listing was stale, or the name is taken by an object this addon does not own
            let existing = api.get(&name).await.map_err(Error::Instances)?;
            if existing.is_owned_by(addon) {
                Ok(existing)
            } else {
                Err(Error::InstanceNameTaken(name))
            }
        }
        Err(err) => Err(Error::Instances(err)),
    }
}

async fn delete_instance(api: &Api<FluxAddonInstance>, instance: &FluxAddonInstance) -> addon_client::Result<()> {
    let name = instance.name_any();
    match api.delete(&name).await {
        Ok(_) => {
            info!(instance = %name, cluster = %instance.spec.cluster_ref, "deleted instance");
            Ok(())
        }
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}

async fn write_status(
    api: &Api<FluxAddon>,
    addon: &FluxAddon,
    observation: &Observation,
    retries: u32,
) -> addon_client::Result<FluxAddon> {
    let now = Utc::now();
    api.modify_status(addon, retries, |obj| {
        let generation = obj.metadata.generation;
        let status = obj.status.get_or_insert_with(Default::default);
        if let Some(matching) = &observation.matching_clusters {
            status.matching_clusters.clone_from(matching);
        }
        for condition in &observation.conditions {
            conditions::set(&mut status.conditions, condition.clone(), now);
        }
        match &observation.ready_override {
            Some(ready) => conditions::set(&mut status.conditions, ready.clone(), now),
            None => conditions::set_summary(&mut status.conditions, now),
        }
        status.observed_generation = generation;
    })
    .await
}

/// Combine the outcome of a pass with the outcome of its status write
fn finish(addon: &FluxAddon, result: Result<Action>, written: addon_client::Result<FluxAddon>) -> Result<Action> {
    match (result, written) {
        (result, Ok(_)) => result,
        // gone in the meantime, nothing left to report on
        (result, Err(err)) if err.is_not_found() => result,
        (Ok(_), Err(err)) => Err(Error::Store(err)),
        (Err(err), Err(status_err)) => {
            warn!(addon = %addon.name_any(), error = %status_err, "failed to write status");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControllerConfig, NoopInstaller};
    use addon_client::{Client, Fault, MemoryBackend, Verb};
    use addon_core::{
        cluster::Cluster,
        v1alpha1::{FluxAddonInstanceStatus, FluxAddonSpec, InstanceState},
        LabelSelector,
    };

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn cluster(name: &str, pairs: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns1".into()),
                labels: labels(pairs),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn addon(name: &str, selector: &[(&str, &str)]) -> FluxAddon {
        FluxAddon {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns1".into()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            spec: FluxAddonSpec {
                cluster_selector: LabelSelector {
                    match_labels: labels(selector),
                },
                repository_name: "fleet-infra".into(),
            },
            status: None,
        }
    }

    fn cluster_ref(name: &str) -> ObjectReference {
        cluster(name, &[]).object_ref()
    }

    fn with_ready(mut instance: FluxAddonInstance, ready: Condition) -> FluxAddonInstance {
        instance.status = Some(FluxAddonInstanceStatus {
            conditions: vec![ready],
            ..Default::default()
        });
        instance
    }

    struct Env {
        backend: MemoryBackend,
        ctx: Arc<Context>,
        clusters: Api<Cluster>,
        addons: Api<FluxAddon>,
        instances: Api<FluxAddonInstance>,
    }

    impl Env {
        fn new() -> Self {
            Self::with_config(ControllerConfig::default())
        }

        fn with_config(config: ControllerConfig) -> Self {
            let backend = MemoryBackend::new();
            let client = Client::new(backend.clone());
            Self {
                ctx: Arc::new(Context::new(client.clone(), Arc::new(NoopInstaller), config)),
                clusters: Api::namespaced(client.clone(), "ns1"),
                addons: Api::namespaced(client.clone(), "ns1"),
                instances: Api::namespaced(client, "ns1"),
                backend,
            }
        }

        async fn reconcile(&self, name: &str) -> Result<Action> {
            let addon = self.addons.get(name).await.unwrap();
            reconcile(Arc::new(addon), self.ctx.clone()).await
        }

        async fn reconcile_instance(&self, name: &str) -> Result<Action> {
            let instance = self.instances.get(name).await.unwrap();
            crate::instance::reconcile(Arc::new(instance), self.ctx.clone()).await
        }

        async fn instance_names(&self) -> Vec<String> {
            let all = self.instances.list(&ListParams::default()).await.unwrap();
            all.iter().map(ResourceExt::name_any).collect()
        }
    }

    #[test]
    fn plan_creates_missing_and_deletes_unselected() {
        let addon = addon("flux-a", &[]);
        let keep = new_instance(&addon, &cluster_ref("c1")).unwrap();
        let stale = new_instance(&addon, &cluster_ref("c2")).unwrap();
        let desired = [cluster_ref("c1"), cluster_ref("c3")].into_iter().collect();

        let plan = plan(&addon, &desired, &[keep, stale.clone()]);
        assert_eq!(plan.create, vec![cluster_ref("c3")]);
        assert_eq!(plan.delete, vec![stale]);
        assert!(plan.update.is_empty());
    }

    #[test]
    fn plan_fixes_source_drift_and_ignores_deleting_instances() {
        let addon = addon("flux-a", &[]);
        let mut drifted = new_instance(&addon, &cluster_ref("c1")).unwrap();
        drifted.spec.repo_name = "old-infra".into();
        let mut leaving = new_instance(&addon, &cluster_ref("c2")).unwrap();
        leaving.metadata.deletion_timestamp = Some(Utc::now());
        let desired = [cluster_ref("c1"), cluster_ref("c2")].into_iter().collect();

        let plan = plan(&addon, &desired, &[drifted.clone(), leaving]);
        assert_eq!(plan.update, vec![drifted]);
        assert!(plan.create.is_empty());
        assert!(plan.delete.is_empty());

        let converged = plan_for_converged(&addon);
        assert!(converged.is_empty());
    }

    fn plan_for_converged(addon: &FluxAddon) -> Plan {
        let owned = [new_instance(addon, &cluster_ref("c1")).unwrap()];
        plan(addon, &[cluster_ref("c1")].into_iter().collect(), &owned)
    }

    #[test]
    fn instance_names_are_unique_per_pair() {
        assert_eq!(instance_name("flux-a", "c1"), instance_name("flux-a", "c1"));
        assert!(instance_name("flux-a", "c1").starts_with("flux-a-c1-"));
        assert_ne!(instance_name("a", "b-c"), instance_name("a-b", "c"));
        assert_ne!(instance_name("flux-a", "c1"), instance_name("flux-a", "c2"));
    }

    #[tokio::test]
    async fn addons_with_overlapping_names_both_get_instances() {
        let env = Env::new();
        env.clusters.create(&cluster("b-c", &[])).await.unwrap();
        env.clusters.create(&cluster("c", &[])).await.unwrap();
        env.addons.create(&addon("a", &[])).await.unwrap();
        env.addons.create(&addon("a-b", &[])).await.unwrap();

        env.reconcile("a").await.unwrap();
        env.reconcile("a-b").await.unwrap();
        let names = env.instance_names().await;
        assert_eq!(names.len(), 4);
        assert!(names.contains(&instance_name("a", "b-c")));
        assert!(names.contains(&instance_name("a-b", "c")));
    }

    #[test]
    fn plan_fixes_filter_label_drift() {
        let mut addon = addon("flux-a", &[]);
        addon.metadata.labels.insert(WATCH_FILTER_LABEL.into(), "team-a".into());
        let mut unlabelled = new_instance(&addon, &cluster_ref("c1")).unwrap();
        unlabelled.labels_mut().remove(WATCH_FILTER_LABEL);

        let plan = plan(&addon, &[cluster_ref("c1")].into_iter().collect(), &[unlabelled.clone()]);
        assert_eq!(plan.update, vec![unlabelled]);
    }

    #[test]
    fn new_instances_are_labelled_owned_and_finalized() {
        let addon = addon("flux-a", &[]);
        let instance = new_instance(&addon, &cluster_ref("c1")).unwrap();
        assert_eq!(instance.name_any(), instance_name("flux-a", "c1"));
        assert_eq!(instance.labels().get(FLUX_ADDON_LABEL).map(String::as_str), Some("flux-a"));
        assert!(instance.is_owned_by(&addon));
        assert_eq!(instance.finalizers(), [FLUX_ADDON_INSTANCE_FINALIZER.to_string()]);
        assert_eq!(instance.spec.repo_name, "fleet-infra");
        assert!(instance.labels().get(WATCH_FILTER_LABEL).is_none());

        let mut filtered = addon.clone();
        filtered.metadata.labels.insert(WATCH_FILTER_LABEL.into(), "team-a".into());
        let instance = new_instance(&filtered, &cluster_ref("c1")).unwrap();
        assert_eq!(instance.labels().get(WATCH_FILTER_LABEL).map(String::as_str), Some("team-a"));

        let mut unsaved = addon.clone();
        unsaved.metadata.uid = None;
        assert!(matches!(
            new_instance(&unsaved, &cluster_ref("c1")),
            Err(Error::MissingObjectKey(_))
        ));
    }

    #[test]
    fn failed_instances_outrank_pending_ones() {
        let addon = addon("flux-a", &[]);
        let failed = with_ready(
            new_instance(&addon, &cluster_ref("c1")).unwrap(),
            Condition::falsy(READY, Severity::Error, "InstallFailed", "boom"),
        );
        let pending = new_instance(&addon, &cluster_ref("c2")).unwrap();
        let ready = with_ready(
            new_instance(&addon, &cluster_ref("c3")).unwrap(),
            Condition::truthy(READY),
        );

        let summary = instances_ready(&[pending.clone(), failed, ready.clone()]);
        assert!(summary.is_false_with(Severity::Error));
        assert_eq!(summary.reason, "InstanceFailed");
        assert_eq!(summary.message, format!("instances failed: {}", instance_name("flux-a", "c1")));

        let summary = instances_ready(&[ready.clone(), pending]);
        assert!(summary.is_false_with(Severity::Warning));
        assert_eq!(summary.message, format!("instances not ready: {}", instance_name("flux-a", "c2")));

        assert!(instances_ready(&[ready]).status);
        assert!(instances_ready(&[]).status);
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let env = Env::new();
        env.clusters.create(&cluster("c1", &[("env", "prod")])).await.unwrap();
        env.clusters.create(&cluster("c2", &[("env", "dev")])).await.unwrap();
        env.addons.create(&addon("flux-a", &[("env", "prod")])).await.unwrap();

        env.reconcile("flux-a").await.unwrap();
        let stored = env.addons.get("flux-a").await.unwrap();
        assert_eq!(stored.finalizers(), [FLUX_ADDON_FINALIZER.to_string()]);
        let status = stored.status.clone().unwrap();
        assert_eq!(status.matching_clusters, vec![cluster_ref("c1")]);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.conditions[0].type_, READY);
        assert!(conditions::is_true(&status.conditions, CLUSTERS_SELECTED));
        assert!(conditions::is_true(&status.conditions, INSTANCES_RECONCILED));
        assert_eq!(env.instance_names().await, vec![instance_name("flux-a", "c1")]);

        env.backend.clear_requests();
        env.reconcile("flux-a").await.unwrap();
        assert_eq!(env.backend.mutations(), 0);
        assert_eq!(env.addons.get("flux-a").await.unwrap(), stored);
    }

    #[tokio::test]
    async fn empty_selector_selects_the_whole_namespace() {
        let env = Env::new();
        env.addons.create(&addon("flux-a", &[])).await.unwrap();
        env.reconcile("flux-a").await.unwrap();
        let status = env.addons.get("flux-a").await.unwrap().status.unwrap();
        assert!(status.matching_clusters.is_empty());
        assert!(conditions::is_true(&status.conditions, READY));

        env.clusters.create(&cluster("c1", &[("env", "prod")])).await.unwrap();
        env.clusters.create(&cluster("c2", &[])).await.unwrap();
        env.reconcile("flux-a").await.unwrap();
        assert_eq!(
            env.instance_names().await,
            vec![instance_name("flux-a", "c1"), instance_name("flux-a", "c2")]
        );
    }

    #[tokio::test]
    async fn relabelled_clusters_lose_exactly_their_instance() {
        let env = Env::new();
        env.clusters.create(&cluster("c1", &[("env", "prod")])).await.unwrap();
        env.clusters.create(&cluster("c3", &[("env", "prod")])).await.unwrap();
        env.addons.create(&addon("flux-a", &[("env", "prod")])).await.unwrap();
        env.reconcile("flux-a").await.unwrap();
        let untouched = env.instances.get(&instance_name("flux-a", "c3")).await.unwrap();

        let mut c1 = env.clusters.get("c1").await.unwrap();
        c1.labels_mut().insert("env".into(), "dev".into());
        env.clusters.replace("c1", &c1).await.unwrap();
        env.backend.clear_requests();
        env.reconcile("flux-a").await.unwrap();

        assert_eq!(env.backend.count(Verb::Delete, "FluxAddonInstance"), 1);
        assert_eq!(env.backend.count(Verb::Create, "FluxAddonInstance"), 0);
        assert!(env.instances.get(&instance_name("flux-a", "c1")).await.unwrap().is_deleting());
        assert_eq!(env.instances.get(&instance_name("flux-a", "c3")).await.unwrap(), untouched);
        let status = env.addons.get("flux-a").await.unwrap().status.unwrap();
        assert_eq!(status.matching_clusters, vec![cluster_ref("c3")]);
    }

    #[tokio::test]
    async fn invalid_selectors_are_reported_as_errors() {
        let env = Env::new();
        env.addons.create(&addon("flux-a", &[("-env", "prod")])).await.unwrap();
        let err = env.reconcile("flux-a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));

        let status = env.addons.get("flux-a").await.unwrap().status.unwrap();
        let selected = conditions::get(&status.conditions, CLUSTERS_SELECTED).unwrap();
        assert!(selected.is_false_with(Severity::Error));
        assert_eq!(selected.reason, "InvalidSelector");
        let ready = conditions::get(&status.conditions, READY).unwrap();
        assert!(ready.is_false_with(Severity::Error));
        assert_eq!(ready.reason, "InvalidSelector");
    }

    #[tokio::test]
    async fn unavailable_registry_is_a_warning() {
        let env = Env::new();
        env.addons.create(&addon("flux-a", &[])).await.unwrap();
        env.backend.inject_fault(Verb::List, "Cluster", Fault::Unavailable);
        let err = env.reconcile("flux-a").await.unwrap_err();
        assert!(matches!(err, Error::ClusterList(_)));

        let status = env.addons.get("flux-a").await.unwrap().status.unwrap();
        let ready = conditions::get(&status.conditions, READY).unwrap();
        assert!(ready.is_false_with(Severity::Warning));
        assert_eq!(ready.reason, "ClusterListFailed");
    }

    #[tokio::test]
    async fn status_conflicts_do_not_repeat_side_effects() {
        let env = Env::new();
        env.clusters.create(&cluster("c1", &[("env", "prod")])).await.unwrap();
        env.addons.create(&addon("flux-a", &[("env", "prod")])).await.unwrap();
        env.backend.inject_fault(Verb::ReplaceStatus, "FluxAddon", Fault::Conflict);

        env.reconcile("flux-a").await.unwrap();
        assert_eq!(env.backend.count(Verb::Create, "FluxAddonInstance"), 1);
        assert_eq!(env.backend.count(Verb::ReplaceStatus, "FluxAddon"), 2);
        let status = env.addons.get("flux-a").await.unwrap().status.unwrap();
        assert_eq!(status.matching_clusters, vec![cluster_ref("c1")]);
    }

    #[tokio::test]
    async fn deletion_waits_for_instances() {
        let env = Env::new();
        env.clusters.create(&cluster("c1", &[])).await.unwrap();
        env.addons.create(&addon("flux-a", &[])).await.unwrap();
        env.reconcile("flux-a").await.unwrap();

        env.addons.delete("flux-a").await.unwrap();
        let action = env.reconcile("flux-a").await.unwrap();
        assert_eq!(action, Action::requeue(ControllerConfig::default().cleanup_poll_interval.as_std()));
        let deleting = env.addons.get("flux-a").await.unwrap();
        assert_eq!(deleting.finalizers(), [FLUX_ADDON_FINALIZER.to_string()]);
        let ready = conditions::get(deleting.conditions(), READY).unwrap();
        assert_eq!(ready.reason, "Deleting");
        let instance = env.instances.get(&instance_name("flux-a", "c1")).await.unwrap();
        assert!(instance.is_deleting());

        // the instance reconciler releases the instance once the agent is gone
        env.instances
            .modify(&instance, 3, |i| i.finalizers_mut().clear())
            .await
            .unwrap();
        assert_eq!(env.reconcile("flux-a").await.unwrap(), Action::await_change());
        assert!(env.addons.get_opt("flux-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn addons_without_instances_are_released_immediately() {
        let env = Env::new();
        env.addons.create(&addon("flux-a", &[("env", "prod")])).await.unwrap();
        env.reconcile("flux-a").await.unwrap();
        env.addons.delete("flux-a").await.unwrap();

        assert_eq!(env.reconcile("flux-a").await.unwrap(), Action::await_change());
        assert!(env.addons.get_opt("flux-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paused_addons_are_left_alone() {
        let env = Env::new();
        let mut paused = addon("flux-a", &[]);
        paused
            .metadata
            .annotations
            .insert(addon_core::v1alpha1::PAUSED_ANNOTATION.into(), "true".into());
        env.addons.create(&paused).await.unwrap();
        env.backend.clear_requests();

        assert_eq!(env.reconcile("flux-a").await.unwrap(), Action::await_change());
        assert_eq!(env.backend.mutations(), 0);
    }

    #[tokio::test]
    async fn watch_filtered_addons_install_and_release_their_instances() {
        let env = Env::with_config(ControllerConfig {
            watch_filter: Some("team-a".into()),
            ..ControllerConfig::default()
        });
        env.clusters
            .create(&cluster("c1", &[(WATCH_FILTER_LABEL, "team-a")]))
            .await
            .unwrap();
        env.clusters.create(&cluster("c2", &[])).await.unwrap();
        let mut filtered = addon("flux-a", &[]);
        filtered.metadata.labels.insert(WATCH_FILTER_LABEL.into(), "team-a".into());
        env.addons.create(&filtered).await.unwrap();

        env.reconcile("flux-a").await.unwrap();
        let name = instance_name("flux-a", "c1");
        assert_eq!(env.instance_names().await, vec![name.clone()]);
        let status = env.addons.get("flux-a").await.unwrap().status.unwrap();
        assert_eq!(status.matching_clusters, vec![cluster_ref("c1")]);

        env.reconcile_instance(&name).await.unwrap();
        let installed = env.instances.get(&name).await.unwrap();
        assert_eq!(installed.state(), InstanceState::Ready);

        env.addons.delete("flux-a").await.unwrap();
        env.reconcile("flux-a").await.unwrap();
        assert_eq!(env.reconcile_instance(&name).await.unwrap(), Action::await_change());
        assert!(env.instances.get_opt(&name).await.unwrap().is_none());
        assert_eq!(env.reconcile("flux-a").await.unwrap(), Action::await_change());
        assert!(env.addons.get_opt("flux-a").await.unwrap().is_none());
    }

    struct FixedRegistry(Vec<Cluster>);

    #[async_trait::async_trait]
    impl crate::ClusterRegistry for FixedRegistry {
        async fn list(&self, _namespace: &str) -> addon_client::Result<Vec<Cluster>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn clusters_come_from_the_configured_registry() {
        let mut env = Env::new();
        let ctx = Context::new(env.ctx.client.clone(), Arc::new(NoopInstaller), ControllerConfig::default())
            .with_registry(Arc::new(FixedRegistry(vec![cluster("remote", &[("env", "prod")])])));
        env.ctx = Arc::new(ctx);
        env.clusters.create(&cluster("local", &[("env", "prod")])).await.unwrap();
        env.addons.create(&addon("flux-a", &[("env", "prod")])).await.unwrap();

        env.reconcile("flux-a").await.unwrap();
        assert_eq!(env.instance_names().await, vec![instance_name("flux-a", "remote")]);
    }
}
