//! API helpers for structured interaction with the object store

mod core_methods;
mod modify;

use std::fmt::Debug;

pub use addon_core::{
    dynamic::DynamicObject,
    metadata::{ObjectMeta, TypeMeta},
    params::ListParams,
    watch::WatchEvent,
    Resource, ResourceExt,
};

use crate::Client;

/// The generic Api abstraction
///
/// Binds a [`Client`] to one kind `K`, optionally scoped to one namespace, and handles
/// the conversion between `K` and the [`DynamicObject`]s the backend stores.
#[derive(Clone)]
pub struct Api<K> {
    /// The client to use (from this library)
    pub(crate) client: Client,
    namespace: Option<String>,
    /// Note: Using `iter::Empty` over `PhantomData`, because we never actually keep any
    /// `K` objects, so `Empty` better models our constraints (in particular, `Empty<K>`
    /// is `Send`, even if `K` may not be).
    pub(crate) _phantom: std::iter::Empty<K>,
}

impl<K: Resource> Api<K> {
    /// Resources viewed across all namespaces
    pub fn all(client: Client) -> Self {
        Self {
            client,
            namespace: None,
            _phantom: std::iter::empty(),
        }
    }

    /// Resources within a given namespace
    pub fn namespaced(client: Client, ns: &str) -> Self {
        Self {
            client,
            namespace: Some(ns.to_string()),
            _phantom: std::iter::empty(),
        }
    }

    /// The namespace this Api is scoped to, `None` when viewing all namespaces
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl<K> Debug for Api<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Intentionally destructuring, to cause compile errors when new fields are added
        let Self {
            client: _,
            namespace,
            _phantom,
        } = self;
        f.debug_struct("Api").field("namespace", namespace).finish()
    }
}
