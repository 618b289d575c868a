//! Caches objects in memory

mod object_ref;
/// The in-memory cache and its writer
pub mod store;

pub use self::object_ref::{Extra as ObjectRefExtra, ObjectRef};
use crate::watcher;
use addon_core::Resource;
use futures::{Stream, TryStreamExt};
pub use store::{store, Store};

/// Cache objects from a [`watcher()`](crate::watcher()) stream into a local [`Store`]
///
/// Observes the raw `Stream` of [`watcher::Event`] objects, and modifies the cache.
/// It passes the raw [`watcher()`](crate::watcher()) stream through unmodified.
///
/// ## Usage
/// Create a [`Store`] through [`store::store()`]. The `writer` part is not clonable,
/// and must be moved into the reflector. The `reader` part is the [`Store`] interface
/// that you can send to other parts of your program as state.
///
/// The cache contains the last-seen state of objects,
/// which may lag slightly behind the actual state.
pub fn reflector<K, W>(mut writer: store::Writer<K>, stream: W) -> impl Stream<Item = W::Item>
where
    K: Resource + Clone + 'static,
    W: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    stream.inspect_ok(move |event| writer.apply_watcher_event(event))
}
