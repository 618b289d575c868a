use crate::{
    utils::{event_flatten::EventFlatten, stream_backoff::StreamBackoff, ResettableBackoff},
    watcher,
};

use futures::{Stream, TryStream};

/// Extension trait for streams returned by [`watcher`](watcher()) or [`reflector`](crate::reflector::reflector)
pub trait WatchStreamExt: Stream {
    /// Apply a [`ResettableBackoff`] policy to a [`Stream`] using [`StreamBackoff`]
    fn backoff<B>(self, b: B) -> StreamBackoff<Self, B>
    where
        B: ResettableBackoff,
        Self: TryStream + Sized,
    {
        StreamBackoff::new(self, b)
    }

    /// Apply the default watcher backoff, a jittered exponential from 800ms up to 30s
    fn default_backoff(self) -> StreamBackoff<Self, watcher::DefaultBackoff>
    where
        Self: TryStream + Sized,
    {
        StreamBackoff::new(self, watcher::DefaultBackoff::default())
    }

    /// Flatten a [`watcher()`] stream into a stream of applied objects
    ///
    /// All Added/Modified events are passed through, and critical errors bubble up.
    fn applied_objects<K>(self) -> EventFlatten<Self, K>
    where
        Self: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Sized,
    {
        EventFlatten::new(self, false)
    }

    /// Flatten a [`watcher()`] stream into a stream of touched objects
    ///
    /// All Added/Modified/Deleted events are passed through, and critical errors bubble up.
    fn touched_objects<K>(self) -> EventFlatten<Self, K>
    where
        Self: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Sized,
    {
        EventFlatten::new(self, true)
    }
}
impl<St: ?Sized> WatchStreamExt for St where St: Stream {}
