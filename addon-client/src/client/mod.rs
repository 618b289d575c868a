//! A store client with an injectable [`Backend`]
//!
//! Backends work on [`DynamicObject`]s and identify objects by kind, namespace and name.
//! Typed access is layered on top by [`Api`](crate::Api).
use std::{fmt, sync::Arc};

use addon_core::{DynamicObject, ListParams, WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

mod memory;
pub use memory::{Fault, MemoryBackend, Request, Verb};

/// A stream of change events for one kind
pub type EventStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// Storage operations a [`Client`] dispatches to
///
/// Writes are guarded by optimistic concurrency: `replace` and `replace_status` must carry the
/// `resourceVersion` last read, or fail with [`Error::Conflict`](crate::Error::Conflict).
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch one object
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DynamicObject>;

    /// List objects of a kind, in one namespace or across all of them
    async fn list(&self, kind: &str, namespace: Option<&str>, lp: &ListParams) -> Result<Vec<DynamicObject>>;

    /// Create a new object, the kind is taken from its type fields
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace everything but the status of an object
    async fn replace(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace only the status of an object
    async fn replace_status(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Request deletion
    ///
    /// Returns the object if it is kept alive by finalizers, `None` once it is gone.
    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>>;

    /// Subscribe to changes of a kind, in one namespace or across all of them
    async fn watch(&self, kind: &str, namespace: Option<&str>) -> Result<EventStream>;
}

/// Client for the object store
///
/// Cloning is cheap, every clone talks to the same backend.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Client {
    /// Create a client from a backend
    pub fn new<B: Backend>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}
