//! Runs a user-supplied reconciler function on objects when they (or related objects) are updated

use self::runner::Runner;
use crate::{
    reflector::{self, reflector, ObjectRef, Store},
    scheduler::{scheduler, ScheduleRequest},
    utils::{CancelableJoinHandle, ResettableBackoffWrapper},
    watcher::{self, watcher},
    WatchStreamExt,
};
use addon_client::{api::ListParams, Api};
use addon_core::{ObjectReference, Resource};
use ahash::AHashMap;
use backon::ExponentialBuilder;
use futures::{
    channel::mpsc,
    future::{self, BoxFuture},
    stream::{self, BoxStream, SelectAll},
    Future, FutureExt, Stream, StreamExt, TryFuture, TryFutureExt, TryStream, TryStreamExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{runtime::Handle, time::Instant};
use tracing::{debug, info_span, Instrument};

mod future_hash_map;
mod runner;

/// Failures surfaced by the [`applier`] and [`Controller::run`] streams
///
/// None of them stop the stream, the affected object is retried according to its [`Action`].
#[derive(Debug, Error)]
pub enum Error<ReconcilerErr: 'static, QueueErr: 'static> {
    /// The reconciler returned an error
    #[error("reconciler for object {1} failed")]
    ReconcilerFailed(#[source] ReconcilerErr, ObjectReference),
    /// The reconciler did not finish within the configured deadline, and was cancelled
    #[error("reconciler for object {0} timed out")]
    ReconcileTimedOut(ObjectReference),
    /// One of the trigger streams failed
    #[error("event queue error")]
    QueueError(#[source] QueueErr),
}

/// Results of the reconciliation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Whether (and when) to next trigger the reconciliation if no external watch triggers hit
    ///
    /// For example, use this to query external systems for updates, expire time-limited resources, or
    /// (in your `error_policy`) retry after errors.
    requeue_after: Option<Duration>,
    /// Retry after the next delay of the per-object exponential backoff
    backoff: bool,
}

impl Action {
    /// Action to the reconciliation at this time even if no external watch triggers hit
    ///
    /// This is the best-practice action that ensures eventual consistency of your controller
    /// even in the case of missed changes (which can happen).
    ///
    /// Watch events are not normally missed, so running this once per hour (`Default`) as a fallback is reasonable.
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
            backoff: false,
        }
    }

    /// Do nothing until a change is detected
    ///
    /// This stops the controller periodically reconciling this object until a relevant watch event
    /// was **detected**.
    #[must_use]
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
            backoff: false,
        }
    }

    /// Retry after a delay that grows with every consecutive failure of this object
    ///
    /// The delay starts over once a reconciliation of the object succeeds.
    #[must_use]
    pub fn backoff() -> Self {
        Self {
            requeue_after: None,
            backoff: true,
        }
    }

    /// The fixed requeue delay, if any
    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    /// Whether the retry delay comes from the per-object backoff
    #[must_use]
    pub fn is_backoff(&self) -> bool {
        self.backoff
    }
}

/// Accumulates all options that can be used on a [`Controller`] invocation.
#[derive(Clone, Debug)]
pub struct Config {
    concurrency: usize,
    reconcile_timeout: Duration,
    backoff: ExponentialBuilder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 0,
            reconcile_timeout: Duration::from_secs(60),
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(300))
                .with_factor(2.0)
                .without_max_times(),
        }
    }
}

impl Config {
    /// The maximum number of objects reconciled at the same time
    ///
    /// `0` means no limit. Objects over the limit wait in the queue, an object is never
    /// reconciled twice at the same time regardless of this setting.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// How long a single reconciliation may take before it is cancelled and retried with backoff
    #[must_use]
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// The exponential backoff used by [`Action::backoff`]
    ///
    /// Any retry limit on the builder is lifted, failed objects are retried forever.
    #[must_use]
    pub fn backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff.without_max_times();
        self
    }
}

/// Helper for building custom trigger filters, see [`trigger_self`] and [`trigger_owners`] for some examples.
pub fn trigger_with<T, K, I, S>(
    stream: S,
    mapper: impl Fn(T) -> I,
) -> impl Stream<Item = Result<ObjectRef<K>, S::Error>>
where
    S: TryStream<Ok = T>,
    I: IntoIterator<Item = ObjectRef<K>>,
    K: Resource,
{
    stream
        .map_ok(move |obj| stream::iter(mapper(obj).into_iter().map(Ok)))
        .try_flatten()
}

/// Enqueues the object itself for reconciliation
pub fn trigger_self<S>(stream: S) -> impl Stream<Item = Result<ObjectRef<S::Ok>, S::Error>>
where
    S: TryStream,
    S::Ok: Resource,
{
    trigger_with(stream, |obj| Some(ObjectRef::from_obj(&obj)))
}

/// Enqueues any owners of type `KOwner` for reconciliation
pub fn trigger_owners<KOwner, S>(stream: S) -> impl Stream<Item = Result<ObjectRef<KOwner>, S::Error>>
where
    S: TryStream,
    S::Ok: Resource,
    KOwner: Resource,
{
    trigger_with(stream, |obj| {
        let meta = obj.meta().clone();
        let ns = meta.namespace;
        meta.owner_references
            .into_iter()
            .filter_map(move |owner| ObjectRef::from_owner_ref(ns.as_deref(), &owner))
    })
}

/// Apply a reconciler to an input stream, with a given retry policy
///
/// Takes a `store` parameter for the main object which should be updated by a `reflector`.
///
/// The `queue` is a source of external events that trigger the reconciler,
/// usually taken from a `reflector` and then passed through a trigger function such as
/// [`trigger_self`].
///
/// Objects that are no longer in the `store` when their turn comes are skipped.
///
/// This is the "hard-mode" version of [`Controller`], which allows you some more customization
/// (such as triggering from arbitrary `Stream`s), at the cost of some more verbosity.
pub fn applier<K, QueueStream, ReconcilerFut, Ctx>(
    mut reconciler: impl FnMut(Arc<K>, Arc<Ctx>) -> ReconcilerFut,
    mut error_policy: impl FnMut(Arc<K>, &ReconcilerFut::Error, Arc<Ctx>) -> Action,
    context: Arc<Ctx>,
    store: Store<K>,
    queue: QueueStream,
    config: Config,
) -> impl Stream<Item = Result<(ObjectRef<K>, Action), Error<ReconcilerFut::Error, QueueStream::Error>>>
where
    K: Clone + Resource + 'static,
    ReconcilerFut: TryFuture<Ok = Action>,
    ReconcilerFut::Error: std::error::Error + 'static,
    QueueStream: TryStream<Ok = ObjectRef<K>>,
    QueueStream::Error: std::error::Error + 'static,
{
    let err_context = context.clone();
    let (scheduler_tx, scheduler_rx) = mpsc::unbounded::<ScheduleRequest<ObjectRef<K>>>();
    let (queue_error_tx, queue_error_rx) = mpsc::unbounded::<QueueStream::Error>();

    // Requests come from the trigger queue and from requeues of finished reconciles
    let requests = stream::select(
        queue.into_stream().filter_map(move |res| {
            future::ready(match res {
                Ok(obj_ref) => Some(ScheduleRequest {
                    message: obj_ref,
                    run_at: Instant::now() + Duration::from_millis(1),
                }),
                Err(err) => {
                    // the receiver lives as long as the applier stream
                    queue_error_tx.unbounded_send(err).ok();
                    None
                }
            })
        }),
        scheduler_rx,
    );

    let reconcile_timeout = config.reconcile_timeout;
    let reconciles = Runner::new(scheduler(requests), move |obj_ref: &ObjectRef<K>| {
        let obj_ref = obj_ref.clone();
        let job = store.get(&obj_ref).map(|obj| {
            let reconciler_span = info_span!("reconciling object", "object.ref" = %obj_ref);
            let reconcile = reconciler_span
                .in_scope(|| reconciler(obj.clone(), context.clone()))
                .into_future()
                .instrument(reconciler_span);
            (obj, reconcile)
        });
        Box::pin(async move {
            let Some((obj, reconcile)) = job else {
                debug!(object = %obj_ref, "object is gone from the cache, skipping");
                return None;
            };
            let result = tokio::time::timeout(reconcile_timeout, reconcile).await;
            Some((obj_ref, obj, result))
        })
    })
    .max_concurrent(config.concurrency)
    .filter_map(future::ready);

    let backoff_builder = config.backoff;
    let mut backoffs = AHashMap::<ObjectRef<K>, ResettableBackoffWrapper<ExponentialBuilder>>::new();
    let outcomes = reconciles.map(move |(obj_ref, obj, result)| {
        let (action, output) = match result {
            Ok(Ok(action)) => {
                backoffs.remove(&obj_ref);
                (action.clone(), Ok((obj_ref.clone(), action)))
            }
            Ok(Err(err)) => (
                error_policy(obj, &err, err_context.clone()),
                Err(Error::ReconcilerFailed(err, obj_ref.clone().into())),
            ),
            // the reconciler future was dropped, which also cancels its task
            Err(_elapsed) => (
                Action::backoff(),
                Err(Error::ReconcileTimedOut(obj_ref.clone().into())),
            ),
        };
        let requeue_after = if action.backoff {
            backoffs
                .entry(obj_ref.clone())
                .or_insert_with(|| ResettableBackoffWrapper::new(backoff_builder))
                .next()
        } else {
            action.requeue_after
        };
        if let Some(delay) = requeue_after {
            // the receiver lives as long as the applier stream
            scheduler_tx
                .unbounded_send(ScheduleRequest {
                    message: obj_ref,
                    run_at: Instant::now() + delay,
                })
                .ok();
        }
        output
    });

    stream::select(outcomes, queue_error_rx.map(|err| Err(Error::QueueError(err))))
}

/// Controller for a kind `K`
///
/// A controller is made up of:
/// - 1 `reflector` (for the core object)
/// - N `watcher` objects for each object child object
/// - user defined `reconcile` + `error_policy` callbacks
/// - a generated input stream considering all sources
///
/// And all reconcile requests through an internal scheduler
///
/// ```no_run
/// use addon_client::{api::ListParams, Api, Client, MemoryBackend};
/// use addon_core::{v1alpha1::FluxAddon, ResourceExt};
/// use addon_runtime::controller::{Action, Controller};
/// use futures::StreamExt;
/// use std::{sync::Arc, time::Duration};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("reconcile failed")]
/// struct Error;
///
/// /// The reconciler that will be called when either object change
/// async fn reconcile(addon: Arc<FluxAddon>, _ctx: Arc<()>) -> Result<Action, Error> {
///     println!("reconciling {}", addon.name_any());
///     Ok(Action::requeue(Duration::from_secs(300)))
/// }
///
/// /// an error handler that will be called when the reconciler fails
/// fn error_policy(_object: Arc<FluxAddon>, _error: &Error, _ctx: Arc<()>) -> Action {
///     Action::backoff()
/// }
///
/// # async fn wrapper() {
/// let addons = Api::<FluxAddon>::all(Client::new(MemoryBackend::new()));
/// Controller::new(addons, ListParams::default())
///     .run(reconcile, error_policy, Arc::new(()))
///     .for_each(|res| async move {
///         match res {
///             Ok(o) => println!("reconciled {:?}", o),
///             Err(e) => println!("reconcile failed: {}", e),
///         }
///     })
///     .await; // controller does nothing unless polled
/// # }
/// ```
pub struct Controller<K>
where
    K: Clone + Resource + Debug + 'static,
{
    // NB: Need to Unpin for stream::select_all
    trigger_selector: SelectAll<BoxStream<'static, Result<ObjectRef<K>, watcher::Error>>>,
    shutdown_selector: Vec<BoxFuture<'static, ()>>,
    reader: Store<K>,
    config: Config,
}

impl<K> Controller<K>
where
    K: Clone + Resource + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    /// Create a Controller on a type `K`
    ///
    /// Configure `ListParams` and `Api` so you only get reconcile events
    /// for the correct `Api` scope (all/namespaced), or `ListParams` subset
    #[must_use]
    pub fn new(main_api: Api<K>, lp: ListParams) -> Self {
        let (reader, writer) = reflector::store();
        let self_watcher = trigger_self(
            reflector(writer, watcher(main_api, lp))
                .default_backoff()
                .applied_objects(),
        )
        .boxed();
        let mut trigger_selector = stream::SelectAll::new();
        trigger_selector.push(self_watcher);
        Self {
            trigger_selector,
            shutdown_selector: Vec::new(),
            reader,
            config: Config::default(),
        }
    }

    /// Retrieve a copy of the reader before starting the controller
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Specify the configuration for the controller's behavior
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Indicate child objects `K` owns and be notified when they change
    ///
    /// The `Child` objects must have an owner reference pointing back to `K`.
    /// You can customize the parameters used by the underlying `watcher` if
    /// only a subset of `Child` entries are required.
    #[must_use]
    pub fn owns<Child>(mut self, api: Api<Child>, lp: ListParams) -> Self
    where
        Child: Clone + Resource + DeserializeOwned + Serialize + Debug + Send + 'static,
    {
        let child_watcher = trigger_owners(watcher(api, lp).default_backoff().touched_objects());
        self.trigger_selector.push(child_watcher.boxed());
        self
    }

    /// Indicate an object to watch with a custom mapper
    ///
    /// The mapper runs synchronously inside the trigger stream, so it should only read caches
    /// (such as [`Controller::store`]) and never block.
    #[must_use]
    pub fn watches<Other, I>(
        mut self,
        api: Api<Other>,
        lp: ListParams,
        mapper: impl Fn(Other) -> I + Send + 'static,
    ) -> Self
    where
        Other: Clone + Resource + DeserializeOwned + Serialize + Debug + Send + 'static,
        I: 'static + IntoIterator<Item = ObjectRef<K>>,
        I::IntoIter: Send,
    {
        let other_watcher = trigger_with(watcher(api, lp).default_backoff().touched_objects(), mapper);
        self.trigger_selector.push(other_watcher.boxed());
        self
    }

    /// Stop the controller once `shutdown` resolves
    ///
    /// Reconciles that are still running at that point are cancelled. Can be called several
    /// times, the first signal to resolve wins.
    #[must_use]
    pub fn shutdown_on(mut self, shutdown: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown_selector.push(shutdown.boxed());
        self
    }

    /// Consume all the parameters of the Controller and start the applier stream
    ///
    /// This creates a stream from all builder calls and starts an applier with
    /// a specified `reconciler` and `error_policy` callbacks. Each of these will be called
    /// with the shared `context`. Every reconcile runs as its own tokio task.
    pub fn run<ReconcilerFut, Ctx>(
        self,
        mut reconciler: impl FnMut(Arc<K>, Arc<Ctx>) -> ReconcilerFut,
        error_policy: impl FnMut(Arc<K>, &ReconcilerFut::Error, Arc<Ctx>) -> Action,
        context: Arc<Ctx>,
    ) -> impl Stream<Item = Result<(ObjectRef<K>, Action), Error<ReconcilerFut::Error, watcher::Error>>>
    where
        ReconcilerFut: TryFuture<Ok = Action> + Send + 'static,
        ReconcilerFut::Error: std::error::Error + Send + 'static,
    {
        let shutdown = if self.shutdown_selector.is_empty() {
            future::pending().boxed()
        } else {
            future::select_all(self.shutdown_selector).map(|_| ()).boxed()
        };
        applier(
            move |obj, ctx| {
                CancelableJoinHandle::spawn(
                    reconciler(obj, ctx).into_future().in_current_span(),
                    &Handle::current(),
                )
            },
            error_policy,
            context,
            self.reader,
            self.trigger_selector,
            self.config,
        )
        .take_until(shutdown)
    }
}
