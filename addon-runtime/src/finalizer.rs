//! Finalizer helper for [`Controller`](crate::Controller) reconcilers
use crate::controller::Action;
use addon_client::Api;
use addon_core::{Resource, ResourceExt};
use futures::{TryFuture, TryFutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{error::Error as StdError, fmt::Debug, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

/// How often adding or removing a finalizer is retried after a write conflict
pub const CONFLICT_RETRIES: u32 = 3;

/// Failures of [`finalizer`]
#[derive(Debug, Error)]
pub enum Error<ReconcileErr>
where
    ReconcileErr: StdError + 'static,
{
    /// [`Event::Apply`] failed
    #[error("failed to apply object: {0}")]
    ApplyFailed(#[source] ReconcileErr),
    /// [`Event::Cleanup`] failed, the finalizer was kept
    #[error("failed to clean up object: {0}")]
    CleanupFailed(#[source] ReconcileErr),
    /// Writing the finalizer failed
    #[error("failed to add finalizer: {0}")]
    AddFinalizer(#[source] addon_client::Error),
    /// Clearing the finalizer after a successful cleanup failed
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] addon_client::Error),
    /// Finalizers can only be managed on named objects
    #[error("object has no name")]
    UnnamedObject,
}

struct FinalizerState {
    has_finalizer: bool,
    is_deleting: bool,
}

impl FinalizerState {
    fn for_object<K: Resource>(obj: &K, finalizer_name: &str) -> Self {
        Self {
            has_finalizer: obj.finalizers().iter().any(|fin| fin == finalizer_name),
            is_deleting: obj.is_deleting(),
        }
    }
}

/// Reconcile an object in a way that requires cleanup before an object can be deleted.
///
/// It does this by managing a `metadata.finalizers` entry,
/// which prevents the object from being deleted before the cleanup is done.
///
/// In typical usage, if you use `finalizer` then it should be the only top-level "action"
/// in your [`applier`](crate::applier)/[`Controller`](crate::Controller)'s `reconcile` function.
///
/// # Expected Flow
///
/// 1. User creates object
/// 2. Reconciler sees object
/// 3. `finalizer` adds `finalizer_name` to `metadata.finalizers`
/// 4. `finalizer` runs [`Event::Apply`] on the updated object
/// 5. User updates object
/// 6. Reconciler sees updated object
/// 7. `finalizer` runs [`Event::Apply`]
/// 8. User deletes object
/// 9. Reconciler sees deleting object
/// 10. `finalizer` runs [`Event::Cleanup`]
/// 11. `finalizer` removes `finalizer_name` from `metadata.finalizers`
/// 12. The store sees that all finalizers are gone and finally deletes the object
///
/// # Guarantees
///
/// If [`Event::Apply`] is ever started then [`Event::Cleanup`] must succeed before the object deletion completes.
///
/// # Assumptions
///
/// `finalizer_name` must be unique among the controllers interacting with the object
///
/// [`Event::Apply`] and [`Event::Cleanup`] must both be idempotent, and tolerate being executed several times (even if previously cancelled).
///
/// [`Event::Cleanup`] must tolerate [`Event::Apply`] never having ran at all, or never having succeeded. Keep in mind that
/// even infallible `.await`s are cancellation points.
///
/// # Caveats
///
/// Object deletes will get stuck while the controller is not running, or if `cleanup` fails for some reason.
///
/// `reconcile` should take the object that the [`Event`] contains, rather than trying to reuse `obj`, since it may have been updated.
///
/// # Errors
///
/// [`Event::Apply`] and [`Event::Cleanup`] are both fallible, their errors are passed through as [`Error::ApplyFailed`]
/// and [`Error::CleanupFailed`], respectively.
///
/// In addition, adding and removing the finalizer itself may fail, for example when the store is
/// unavailable or the object keeps being updated concurrently for more than [`CONFLICT_RETRIES`] attempts.
pub async fn finalizer<K, ReconcileFut>(
    api: &Api<K>,
    finalizer_name: &str,
    obj: Arc<K>,
    reconcile: impl FnOnce(Event<K>) -> ReconcileFut,
) -> Result<Action, Error<ReconcileFut::Error>>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + PartialEq + Send + 'static,
    ReconcileFut: TryFuture<Ok = Action>,
    ReconcileFut::Error: StdError + 'static,
{
    if obj.meta().name.is_none() {
        return Err(Error::UnnamedObject);
    }
    match FinalizerState::for_object(&*obj, finalizer_name) {
        FinalizerState {
            has_finalizer: true,
            is_deleting: false,
        } => reconcile(Event::Apply(obj))
            .into_future()
            .await
            .map_err(Error::ApplyFailed),
        FinalizerState {
            has_finalizer: true,
            is_deleting: true,
        } => {
            // Cleanup reconciliation must succeed before it's safe to remove the finalizer
            let action = reconcile(Event::Cleanup(obj.clone()))
                .into_future()
                .await
                // Short-circuit, so that we keep the finalizer if cleanup fails
                .map_err(Error::CleanupFailed)?;
            remove_finalizer(api, &*obj, finalizer_name, CONFLICT_RETRIES)
                .await
                .map_err(Error::RemoveFinalizer)?;
            Ok(action)
        }
        FinalizerState {
            has_finalizer: false,
            is_deleting: false,
        } => {
            // Finalizer must be added before it's safe to run an `Apply` reconciliation
            let updated = ensure_finalizer(api, &*obj, finalizer_name, CONFLICT_RETRIES)
                .await
                .map_err(Error::AddFinalizer)?;
            reconcile(Event::Apply(Arc::new(updated)))
                .into_future()
                .await
                .map_err(Error::ApplyFailed)
        }
        FinalizerState {
            has_finalizer: false,
            is_deleting: true,
        } => {
            // Our work here is done
            Ok(Action::await_change())
        }
    }
}

/// Add `finalizer_name` to the finalizers of `obj` unless it is already there
///
/// Conflicts are retried against the latest version of the object, at most `retries` times.
/// Returns the object as stored afterwards.
pub async fn ensure_finalizer<K>(
    api: &Api<K>,
    obj: &K,
    finalizer_name: &str,
    retries: u32,
) -> addon_client::Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + PartialEq + Send + 'static,
{
    let updated = api
        .modify(obj, retries, |o| {
            if !o.finalizers().iter().any(|f| f == finalizer_name) {
                o.finalizers_mut().push(finalizer_name.to_string());
            }
        })
        .await?;
    if !obj.finalizers().iter().any(|f| f == finalizer_name) {
        info!(kind = K::KIND, name = %obj.name_any(), finalizer = finalizer_name, "added finalizer");
    }
    Ok(updated)
}

/// Remove `finalizer_name` from the finalizers of `obj`
///
/// An object that is already gone counts as success, since nothing is left to guard.
pub async fn remove_finalizer<K>(
    api: &Api<K>,
    obj: &K,
    finalizer_name: &str,
    retries: u32,
) -> addon_client::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + PartialEq + Send + 'static,
{
    match api
        .modify(obj, retries, |o| o.finalizers_mut().retain(|f| f != finalizer_name))
        .await
    {
        Ok(_) => {
            info!(kind = K::KIND, name = %obj.name_any(), finalizer = finalizer_name, "removed finalizer");
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            debug!(kind = K::KIND, name = %obj.name_any(), "object already gone");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// A representation of an action that should be taken by a reconciler.
#[derive(Debug)]
pub enum Event<K> {
    /// The reconciler should ensure that the actual state matches the state desired in the object.
    ///
    /// This must be idempotent, since it may be recalled if, for example (this list is non-exhaustive):
    ///
    /// - The controller is restarted
    /// - The object is updated
    /// - The reconciliation fails
    Apply(Arc<K>),
    /// The object is being deleted, and the reconciler should remove all resources that it owns.
    ///
    /// This must be idempotent, since it may be recalled if, for example (this list is non-exhaustive):
    ///
    /// - The controller is restarted while the deletion is in progress
    /// - The reconciliation fails
    /// - Another finalizer was removed in the meantime
    Cleanup(Arc<K>),
}

#[cfg(test)]
mod tests {
    use super::{ensure_finalizer, finalizer, remove_finalizer, Error, Event};
    use crate::controller::Action;
    use addon_client::{Api, Client, Fault, MemoryBackend, Verb};
    use addon_core::{cluster::Cluster, ObjectMeta, ResourceExt};
    use std::{convert::Infallible, sync::Arc};

    const FIN: &str = "test.addons.cluster.x-k8s.io";

    #[derive(Debug, thiserror::Error)]
    #[error("cleanup refused")]
    struct Refused;

    fn cluster(name: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn api(backend: &MemoryBackend) -> Api<Cluster> {
        Api::namespaced(Client::new(backend.clone()), "ns1")
    }

    #[tokio::test]
    async fn apply_runs_after_the_finalizer_was_added() {
        let backend = MemoryBackend::new();
        let api = api(&backend);
        let created = api.create(&cluster("c1")).await.unwrap();

        let action = finalizer(&api, FIN, Arc::new(created), |event| async move {
            match event {
                Event::Apply(obj) => {
                    assert_eq!(obj.finalizers(), [FIN.to_string()]);
                    Ok::<_, Infallible>(Action::await_change())
                }
                Event::Cleanup(_) => panic!("object is not being deleted"),
            }
        })
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(api.get("c1").await.unwrap().finalizers(), [FIN.to_string()]);
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_the_finalizer() {
        let backend = MemoryBackend::new();
        let api = api(&backend);
        let created = api.create(&cluster("c1")).await.unwrap();
        ensure_finalizer(&api, &created, FIN, 0).await.unwrap();
        let deleting = api.delete("c1").await.unwrap().unwrap();

        let result = finalizer(&api, FIN, Arc::new(deleting.clone()), |_| async { Err::<Action, _>(Refused) }).await;
        assert!(matches!(result, Err(Error::CleanupFailed(Refused))));
        assert!(api.get_opt("c1").await.unwrap().is_some());

        finalizer(&api, FIN, Arc::new(deleting), |event| async move {
            assert!(matches!(event, Event::Cleanup(_)));
            Ok::<_, Refused>(Action::await_change())
        })
        .await
        .unwrap();
        assert!(api.get_opt("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalizer_writes_retry_conflicts() {
        let backend = MemoryBackend::new();
        let api = api(&backend);
        let created = api.create(&cluster("c1")).await.unwrap();
        backend.inject_fault(Verb::Replace, "Cluster", Fault::Conflict);

        let updated = ensure_finalizer(&api, &created, FIN, 1).await.unwrap();
        assert_eq!(updated.finalizers(), [FIN.to_string()]);
        // adding it again changes nothing and writes nothing
        let writes = backend.count(Verb::Replace, "Cluster");
        ensure_finalizer(&api, &updated, FIN, 1).await.unwrap();
        assert_eq!(backend.count(Verb::Replace, "Cluster"), writes);

        remove_finalizer(&api, &updated, FIN, 1).await.unwrap();
        assert!(api.get("c1").await.unwrap().finalizers().is_empty());
    }

    #[tokio::test]
    async fn removing_from_a_vanished_object_succeeds() {
        let backend = MemoryBackend::new();
        let api = api(&backend);
        let mut gone = api.create(&cluster("c1")).await.unwrap();
        api.delete("c1").await.unwrap();
        gone.metadata.finalizers.push(FIN.into());
        backend.inject_fault(Verb::Replace, "Cluster", Fault::Conflict);
        remove_finalizer(&api, &gone, FIN, 1).await.unwrap();
    }
}
