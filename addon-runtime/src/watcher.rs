//! Watches a kind for changes, with error recovery
//!
//! See [`watcher`] for the primary entry point.

use crate::utils::{ResettableBackoff, ResettableBackoffWrapper};
use addon_client::{api::ListParams, Api};
use addon_core::{Resource, ResourceExt, WatchEvent};
use backon::ExponentialBuilder;
use futures::{future, stream::BoxStream, Stream, StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, time::Duration};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the [`watcher`], none of them terminate the stream
#[derive(Error, Debug)]
pub enum Error {
    /// The list that seeds a fresh watch failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] addon_client::Error),
    /// The watch subscription could not be opened
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] addon_client::Error),
    /// The store sent an error on an open watch
    #[error("error returned by the store during watch: {0}")]
    WatchFailed(#[source] addon_client::Error),
}
/// Result of a [`watcher`] step
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq)]
/// Watch events returned from the [`watcher`]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable. Use finalizers instead.
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

impl<K> Event<K> {
    /// Flattens out all objects that were added or modified in the event.
    ///
    /// `Deleted` objects are ignored, all objects mentioned by `Restarted` events are
    /// emitted individually.
    pub fn into_iter_applied(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) => vec![obj],
            Event::Deleted(_) => vec![],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }

    /// Flattens out all objects that were added, modified, or deleted in the event.
    ///
    /// Note that `Deleted` events may be missed when restarting the stream. Use finalizers
    /// or owner references instead if you care about cleaning up external resources after
    /// deleted objects.
    pub fn into_iter_touched(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) | Event::Deleted(obj) => vec![obj],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// The next poll subscribes and then lists all existing objects
    Empty,
    /// The initial list was delivered, from this point we just return events from the store.
    ///
    /// When the subscription ends we go back to `Empty` and list again.
    Watching {
        stream: BoxStream<'static, addon_client::Result<WatchEvent<K>>>,
    },
}

impl<K> Debug for State<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Empty => f.write_str("Empty"),
            State::Watching { .. } => f.write_str("Watching"),
        }
    }
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<K>(
    api: &Api<K>,
    list_params: &ListParams,
    state: State<K>,
) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
{
    match state {
        // Subscribing before listing means nothing written in between is lost,
        // at worst it is seen twice.
        State::Empty => match api.watch(list_params).await {
            Ok(stream) => match api.list(list_params).await {
                Ok(list) => (Some(Ok(Event::Restarted(list))), State::Watching { stream }),
                Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
            },
            Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::Empty),
        },
        State::Watching { mut stream } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                (Some(Ok(Event::Applied(obj))), State::Watching { stream })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => (Some(Ok(Event::Deleted(obj))), State::Watching { stream }),
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::Watching { stream }),
            None => {
                debug!(kind = K::KIND, "watch ended, relisting");
                (None, State::Empty)
            }
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<K>(api: &Api<K>, list_params: &ListParams, mut state: State<K>) -> (Result<Event<K>>, State<K>)
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
{
    loop {
        match step_trampolined(api, list_params, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a kind for changes continuously
///
/// Compared to [`Api::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode on the next poll.
/// Apply a backoff with [`WatchStreamExt::default_backoff`](crate::WatchStreamExt::default_backoff) to avoid
/// hammering the store while it is unavailable. Keep in mind that some [`TryStream`](futures::TryStream)
/// combinators (such as [`try_for_each`](futures::TryStreamExt::try_for_each)) will terminate eagerly
/// as soon as they receive an [`Err`].
///
/// This is intended to provide a safe and atomic input interface for a state store like a
/// [`reflector`](crate::reflector()), direct users may want to flatten composite events with
/// [`WatchStreamExt::applied_objects`](crate::WatchStreamExt::applied_objects):
///
/// ```no_run
/// use addon_client::{Api, Client, MemoryBackend};
/// use addon_core::{cluster::Cluster, ListParams, ResourceExt};
/// use addon_runtime::{watcher, WatchStreamExt};
/// use futures::TryStreamExt;
/// # async fn wrapper() -> Result<(), addon_runtime::watcher::Error> {
/// let clusters: Api<Cluster> = Api::namespaced(Client::new(MemoryBackend::new()), "ns1");
/// watcher(clusters, ListParams::default())
///     .applied_objects()
///     .try_for_each(|c| async move {
///         println!("Applied: {}", c.name_any());
///         Ok(())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Recovery
///
/// Every (re)start subscribes to changes first and lists second, emitting the list as an
/// [`Event::Restarted`]. When the subscription ends the watcher starts over the same way.
pub fn watcher<K>(api: Api<K>, list_params: ListParams) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
{
    futures::stream::unfold(
        (api, list_params, State::Empty),
        |(api, list_params, state)| async {
            let (event, state) = step(&api, &list_params, state).await;
            Some((event, (api, list_params, state)))
        },
    )
}

/// Watches a single object by name
///
/// Emits `Some` with the latest version of the object whenever it changes, and `None`
/// whenever it is found to be missing.
pub fn watch_object<K>(api: Api<K>, name: &str) -> impl Stream<Item = Result<Option<K>>> + Send
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
{
    let name = name.to_string();
    watcher(api, ListParams::default()).try_filter_map(move |event| {
        future::ready(Ok(match event {
            Event::Applied(obj) if obj.name_any() == name => Some(Some(obj)),
            Event::Deleted(obj) if obj.name_any() == name => Some(None),
            Event::Restarted(objs) => Some(objs.into_iter().find(|obj| obj.name_any() == name)),
            Event::Applied(_) | Event::Deleted(_) => None,
        }))
    })
}

/// Default watcher backoff inspired by client-go
///
/// Jittered exponential from 800ms, doubling up to 30s, never giving up.
pub struct DefaultBackoff(ResettableBackoffWrapper<ExponentialBuilder>);

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self(ResettableBackoffWrapper::new(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(800))
                .with_max_delay(Duration::from_secs(30))
                .with_factor(2.0)
                .with_jitter()
                .without_max_times(),
        ))
    }
}

impl Iterator for DefaultBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl ResettableBackoff for DefaultBackoff {
    fn reset(&mut self) {
        self.0.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::{watcher, Error, Event};
    use addon_client::{Api, Client, Fault, MemoryBackend, Verb};
    use addon_core::{cluster::Cluster, ListParams, ObjectMeta, ResourceExt};
    use futures::{pin_mut, StreamExt};
    use std::collections::BTreeMap;

    fn cluster(name: &str, env: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: BTreeMap::from([("env".to_string(), env.to_string())]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(objs: &[Cluster]) -> Vec<String> {
        objs.iter().map(ResourceExt::name_any).collect()
    }

    #[tokio::test]
    async fn lists_then_follows_changes() {
        let api: Api<Cluster> = Api::namespaced(Client::new(MemoryBackend::new()), "ns1");
        api.create(&cluster("c1", "prod")).await.unwrap();

        let events = watcher(api.clone(), ListParams::default());
        pin_mut!(events);
        match events.next().await {
            Some(Ok(Event::Restarted(objs))) => assert_eq!(names(&objs), vec!["c1"]),
            other => panic!("unexpected first event {other:?}"),
        }

        api.create(&cluster("c2", "dev")).await.unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Applied(c))) if c.name_any() == "c2"));
        api.delete("c1").await.unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Deleted(c))) if c.name_any() == "c1"));
    }

    #[tokio::test]
    async fn label_filters_are_applied_to_events() {
        let api: Api<Cluster> = Api::namespaced(Client::new(MemoryBackend::new()), "ns1");
        let events = watcher(api.clone(), ListParams::default().labels("env=prod").unwrap());
        pin_mut!(events);
        assert!(matches!(events.next().await, Some(Ok(Event::Restarted(objs))) if objs.is_empty()));

        api.create(&cluster("c1", "dev")).await.unwrap();
        api.create(&cluster("c2", "prod")).await.unwrap();
        assert!(matches!(events.next().await, Some(Ok(Event::Applied(c))) if c.name_any() == "c2"));
    }

    #[tokio::test]
    async fn failed_lists_are_surfaced_and_retried() {
        let backend = MemoryBackend::new();
        backend.inject_fault(Verb::List, "Cluster", Fault::Unavailable);
        let api: Api<Cluster> = Api::namespaced(Client::new(backend), "ns1");
        api.create(&cluster("c1", "prod")).await.unwrap();

        let events = watcher(api, ListParams::default());
        pin_mut!(events);
        assert!(matches!(events.next().await, Some(Err(Error::InitialListFailed(_)))));
        assert!(matches!(events.next().await, Some(Ok(Event::Restarted(objs))) if names(&objs) == ["c1"]));
    }

    #[test]
    fn flattening_events() {
        let restarted = Event::Restarted(vec![1, 2]);
        assert_eq!(restarted.clone().into_iter_applied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(Event::Deleted(3).into_iter_applied().count(), 0);
        assert_eq!(Event::Deleted(3).into_iter_touched().collect::<Vec<_>>(), vec![3]);
    }
}
