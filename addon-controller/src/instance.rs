//! Reconciler for `FluxAddonInstance`: drives the installer for one (addon, cluster) pair
use crate::{
    installer::{self, InstallOutcome, RemoveOutcome},
    predicates, Context, Error, Result,
};
use addon_client::Api;
use addon_core::{
    conditions::{self, Condition, Severity, READY},
    v1alpha1::{FluxAddonInstance, InstanceState, AGENT_INSTALLED, FLUX_ADDON_INSTANCE_FINALIZER},
    Resource, ResourceExt,
};
use addon_runtime::{
    controller::Action,
    finalizer::{finalizer, Event},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a pass reports on the instance status
#[derive(Debug)]
struct Report {
    state: InstanceState,
    installed: Option<Condition>,
    ready_override: Option<Condition>,
}

/// Controller triggers this whenever an instance changed, and on every requeue
pub async fn reconcile(instance: Arc<FluxAddonInstance>, ctx: Arc<Context>) -> Result<Action> {
    if !predicates::not_paused_and_has_filter_label(instance.as_ref(), ctx.watch_filter()) {
        debug!(instance = %instance.name_any(), "paused or filtered out, skipping");
        return Ok(Action::await_change());
    }
    let namespace = instance
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let instances: Api<FluxAddonInstance> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&instances, FLUX_ADDON_INSTANCE_FINALIZER, instance, |event| async {
        match event {
            Event::Apply(instance) => apply(instance, &instances, &ctx).await,
            Event::Cleanup(instance) => cleanup(instance, &instances, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// The controller triggers this on reconcile errors
pub fn error_policy(instance: Arc<FluxAddonInstance>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        instance = %instance.name_any(),
        cluster = %instance.spec.cluster_ref,
        reason = error.reason(),
        %error,
        "reconcile failed"
    );
    Action::backoff()
}

async fn apply(instance: Arc<FluxAddonInstance>, api: &Api<FluxAddonInstance>, ctx: &Context) -> Result<Action> {
    let cluster = &instance.spec.cluster_ref;
    let outcome = installer::apply(
        ctx.installer.as_ref(),
        ctx.config.installer_timeout.as_std(),
        cluster,
        &instance.spec.repo_name,
    )
    .await;

    let (state, condition, result) = match outcome {
        Ok(InstallOutcome::Ready) => (
            InstanceState::Ready,
            Condition::truthy(AGENT_INSTALLED),
            Ok(Action::requeue(ctx.config.resync_period.as_std())),
        ),
        Ok(InstallOutcome::Installing) => (
            InstanceState::Installing,
            Condition::falsy(
                AGENT_INSTALLED,
                Severity::Warning,
                "Installing",
                "waiting for the agent to come up",
            ),
            Ok(Action::requeue(ctx.config.install_poll_interval.as_std())),
        ),
        Ok(InstallOutcome::Failed(reason)) => (
            InstanceState::Failed,
            Condition::falsy(AGENT_INSTALLED, Severity::Error, "InstallFailed", reason.clone()),
            Err(Error::InstallFailed(reason)),
        ),
        Err(err) => (
            InstanceState::Pending,
            Condition::falsy(
                AGENT_INSTALLED,
                Severity::Warning,
                "InstallerUnavailable",
                err.to_string(),
            ),
            Err(Error::Installer(err)),
        ),
    };
    if state != instance.state() {
        info!(instance = %instance.name_any(), %cluster, from = %instance.state(), to = %state, "installation state changed");
    }

    let report = Report {
        state,
        installed: Some(condition),
        ready_override: None,
    };
    let written = write_status(api, &instance, &report, ctx.config.conflict_retries).await;
    finish(&instance, result, written)
}

async fn cleanup(instance: Arc<FluxAddonInstance>, api: &Api<FluxAddonInstance>, ctx: &Context) -> Result<Action> {
    let cluster = &instance.spec.cluster_ref;
    let deleting = Report {
        state: InstanceState::Deleting,
        installed: None,
        ready_override: Some(Condition::falsy(
            READY,
            Severity::Warning,
            "Deleting",
            "removing the agent from the cluster",
        )),
    };
    let instance = match write_status(api, &instance, &deleting, ctx.config.conflict_retries).await {
        Ok(updated) => Arc::new(updated),
        Err(err) if err.is_not_found() => return Ok(Action::await_change()),
        Err(err) => return Err(Error::Store(err)),
    };

    let outcome = installer::remove(
        ctx.installer.as_ref(),
        ctx.config.installer_timeout.as_std(),
        cluster,
        &instance.spec.repo_name,
    )
    .await;
    let (ready, err) = match outcome {
        Ok(RemoveOutcome::Removed) => {
            info!(instance = %instance.name_any(), %cluster, "removed agent from cluster");
            return Ok(Action::await_change());
        }
        Ok(RemoveOutcome::Failed(reason)) => (
            Condition::falsy(READY, Severity::Error, "RemoveFailed", reason.clone()),
            Error::RemoveFailed(reason),
        ),
        Err(err) => (
            Condition::falsy(READY, Severity::Warning, "InstallerUnavailable", err.to_string()),
            Error::Installer(err),
        ),
    };
    let report = Report {
        ready_override: Some(ready),
        ..deleting
    };
    let written = write_status(api, &instance, &report, ctx.config.conflict_retries).await;
    finish(&instance, Err(err), written)
}

async fn write_status(
    api: &Api<FluxAddonInstance>,
    instance: &FluxAddonInstance,
    report: &Report,
    retries: u32,
) -> addon_client::Result<FluxAddonInstance> {
    let now = Utc::now();
    api.modify_status(instance, retries, |obj| {
        let generation = obj.meta().generation;
        let status = obj.status.get_or_insert_with(Default::default);
        status.status = report.state;
        if let Some(installed) = &report.installed {
            conditions::set(&mut status.conditions, installed.clone(), now);
        }
        match &report.ready_override {
            Some(ready) => conditions::set(&mut status.conditions, ready.clone(), now),
            None => conditions::set_summary(&mut status.conditions, now),
        }
        status.observed_generation = generation;
    })
    .await
}

fn finish(
    instance: &FluxAddonInstance,
    result: Result<Action>,
    written: addon_client::Result<FluxAddonInstance>,
) -> Result<Action> {
    match (result, written) {
        (result, Ok(_)) => result,
        (result, Err(err)) if err.is_not_found() => result,
        (Ok(_), Err(err)) => Err(Error::Store(err)),
        (Err(err), Err(status_err)) => {
            warn!(instance = %instance.name_any(), error = %status_err, "failed to write status");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControllerConfig, InstallerError, Installer};
    use addon_client::{Client, Fault, MemoryBackend, Verb};
    use addon_core::{cluster::Cluster, v1alpha1::FluxAddonInstanceSpec, ObjectMeta};
    use addon_runtime::finalizer;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    type Script<T> = Mutex<VecDeque<Result<T, InstallerError>>>;

    /// Replays canned answers, hanging forever once a script runs dry
    #[derive(Default)]
    struct Scripted {
        applies: Script<InstallOutcome>,
        removes: Script<RemoveOutcome>,
        removed: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn applying(outcomes: impl IntoIterator<Item = Result<InstallOutcome, InstallerError>>) -> Self {
            Self {
                applies: Mutex::new(outcomes.into_iter().collect()),
                ..Self::default()
            }
        }

        fn removing(outcomes: impl IntoIterator<Item = Result<RemoveOutcome, InstallerError>>) -> Self {
            Self {
                removes: Mutex::new(outcomes.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Installer for Scripted {
        async fn apply(&self, _: &addon_core::ObjectReference, _: &str) -> Result<InstallOutcome, InstallerError> {
            let next = self.applies.lock().pop_front();
            match next {
                Some(outcome) => outcome,
                None => futures::future::pending().await,
            }
        }

        async fn remove(
            &self,
            cluster: &addon_core::ObjectReference,
            source: &str,
        ) -> Result<RemoveOutcome, InstallerError> {
            let next = self.removes.lock().pop_front();
            if let Some(Ok(RemoveOutcome::Removed)) = &next {
                self.removed.lock().push((cluster.name.clone(), source.to_string()));
            }
            match next {
                Some(outcome) => outcome,
                None => futures::future::pending().await,
            }
        }
    }

    struct Env {
        backend: MemoryBackend,
        ctx: Arc<Context>,
        installer: Arc<Scripted>,
        instances: Api<FluxAddonInstance>,
    }

    impl Env {
        async fn new(installer: Scripted) -> Self {
            let backend = MemoryBackend::new();
            let client = Client::new(backend.clone());
            let installer = Arc::new(installer);
            let instances: Api<FluxAddonInstance> = Api::namespaced(client.clone(), "ns1");
            let cluster_ref = Cluster {
                metadata: ObjectMeta {
                    name: Some("c1".into()),
                    namespace: Some("ns1".into()),
                    ..Default::default()
                },
                ..Default::default()
            }
            .object_ref();
            instances
                .create(&FluxAddonInstance {
                    metadata: ObjectMeta {
                        name: Some("flux-a-c1".into()),
                        finalizers: vec![FLUX_ADDON_INSTANCE_FINALIZER.into()],
                        ..Default::default()
                    },
                    spec: FluxAddonInstanceSpec {
                        cluster_ref,
                        repo_name: "fleet-infra".into(),
                    },
                    status: None,
                })
                .await
                .unwrap();
            Self {
                ctx: Arc::new(Context::new(client, installer.clone(), ControllerConfig::default())),
                backend,
                installer,
                instances,
            }
        }

        async fn reconcile(&self) -> Result<Action> {
            let instance = self.instances.get("flux-a-c1").await.unwrap();
            reconcile(Arc::new(instance), self.ctx.clone()).await
        }

        async fn stored(&self) -> FluxAddonInstance {
            self.instances.get("flux-a-c1").await.unwrap()
        }
    }

    fn ready_condition(instance: &FluxAddonInstance) -> Condition {
        conditions::get(instance.conditions(), READY).cloned().unwrap()
    }

    #[tokio::test]
    async fn installing_then_ready() {
        let env = Env::new(Scripted::applying([Ok(InstallOutcome::Installing), Ok(InstallOutcome::Ready)])).await;
        let config = ControllerConfig::default();

        let action = env.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(config.install_poll_interval.as_std()));
        let installing = env.stored().await;
        assert_eq!(installing.state(), InstanceState::Installing);
        let ready = ready_condition(&installing);
        assert!(ready.is_false_with(Severity::Warning));
        assert_eq!(ready.reason, "Installing");

        let action = env.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(config.resync_period.as_std()));
        let installed = env.stored().await;
        assert_eq!(installed.state(), InstanceState::Ready);
        assert!(conditions::is_true(installed.conditions(), READY));
        assert!(conditions::is_true(installed.conditions(), AGENT_INSTALLED));
        assert_eq!(installed.status.unwrap().observed_generation, Some(1));
    }

    #[tokio::test]
    async fn failed_installs_are_errors() {
        let env = Env::new(Scripted::applying([Ok(InstallOutcome::Failed("no capacity".into()))])).await;
        let err = env.reconcile().await.unwrap_err();
        assert_eq!(err.reason(), "FinalizerError");
        assert!(matches!(
            &err,
            Error::Finalizer(inner) if matches!(**inner, finalizer::Error::ApplyFailed(Error::InstallFailed(_)))
        ));

        let failed = env.stored().await;
        assert_eq!(failed.state(), InstanceState::Failed);
        let ready = ready_condition(&failed);
        assert!(ready.is_false_with(Severity::Error));
        assert_eq!(ready.reason, "InstallFailed");
        assert_eq!(ready.message, "no capacity");
    }

    #[tokio::test]
    async fn unreachable_installer_leaves_instance_pending() {
        let env = Env::new(Scripted::applying([Err(InstallerError::Unavailable("connection refused".into()))])).await;
        assert!(env.reconcile().await.is_err());
        let pending = env.stored().await;
        assert_eq!(pending.state(), InstanceState::Pending);
        let ready = ready_condition(&pending);
        assert!(ready.is_false_with(Severity::Warning));
        assert_eq!(ready.reason, "InstallerUnavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_installer_times_out() {
        let env = Env::new(Scripted::default()).await;
        assert!(env.reconcile().await.is_err());
        let ready = ready_condition(&env.stored().await);
        assert_eq!(ready.reason, "InstallerUnavailable");
        assert!(ready.message.contains("30s"));
    }

    #[tokio::test]
    async fn unchanged_outcomes_write_nothing() {
        let env = Env::new(Scripted::applying([Ok(InstallOutcome::Ready), Ok(InstallOutcome::Ready)])).await;
        env.reconcile().await.unwrap();
        env.backend.clear_requests();
        env.reconcile().await.unwrap();
        assert_eq!(env.backend.mutations(), 0);
    }

    #[tokio::test]
    async fn deletion_removes_the_agent_first() {
        let env = Env::new(Scripted::removing([Ok(RemoveOutcome::Removed)])).await;
        env.instances.delete("flux-a-c1").await.unwrap();
        assert_eq!(env.reconcile().await.unwrap(), Action::await_change());
        assert_eq!(
            *env.installer.removed.lock(),
            vec![("c1".to_string(), "fleet-infra".to_string())]
        );
        assert!(env.instances.get_opt("flux-a-c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_removal_keeps_the_finalizer() {
        let env = Env::new(Scripted::removing([Ok(RemoveOutcome::Failed("cluster unreachable".into()))])).await;
        env.instances.delete("flux-a-c1").await.unwrap();
        assert!(env.reconcile().await.is_err());

        let stuck = env.stored().await;
        assert!(stuck.is_deleting());
        assert_eq!(stuck.finalizers(), [FLUX_ADDON_INSTANCE_FINALIZER.to_string()]);
        assert_eq!(stuck.state(), InstanceState::Deleting);
        let ready = ready_condition(&stuck);
        assert!(ready.is_false_with(Severity::Error));
        assert_eq!(ready.reason, "RemoveFailed");
    }

    #[tokio::test]
    async fn finalizer_conflicts_are_retried() {
        let env = Env::new(Scripted::removing([Ok(RemoveOutcome::Removed)])).await;
        env.instances.delete("flux-a-c1").await.unwrap();
        env.backend.inject_fault(Verb::Replace, "FluxAddonInstance", Fault::Conflict);
        env.reconcile().await.unwrap();
        assert!(env.instances.get_opt("flux-a-c1").await.unwrap().is_none());
    }
}
