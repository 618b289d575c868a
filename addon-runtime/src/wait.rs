//! Waits for objects to reach desired states
use addon_client::Api;
use addon_core::Resource;
use futures::TryStreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use thiserror::Error;

use crate::watcher::{self, watch_object};

/// Failures of [`await_condition`]
#[derive(Debug, Error)]
pub enum Error {
    /// The object could not be watched
    #[error("failed to probe for whether the condition is fulfilled yet: {0}")]
    ProbeFailed(#[source] watcher::Error),
}

/// Watch an object, and wait for some condition `cond` to return `true`.
///
/// `cond` is passed `Some` if the object is found, otherwise `None`.
///
/// # Caveats
///
/// Keep in mind that the condition is typically fulfilled by another controller, which might not even be running.
/// `await_condition` does *not* automatically add a timeout. If this is desired, wrap it in [`tokio::time::timeout`].
///
/// # Errors
///
/// Fails if the store cannot be watched or listed. Does *not* fail if the object is not found.
///
/// # Usage
///
/// ```no_run
/// use addon_client::{Api, Client, MemoryBackend};
/// use addon_core::v1alpha1::FluxAddon;
/// use addon_runtime::wait::{await_condition, conditions};
/// # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let addons: Api<FluxAddon> = Api::namespaced(Client::new(MemoryBackend::new()), "ns1");
/// let deleted = await_condition(addons, "flux-a", conditions::is_deleted("some-uid"));
/// let _ = tokio::time::timeout(std::time::Duration::from_secs(10), deleted).await?;
/// # Ok(())
/// # }
/// ```
pub async fn await_condition<K>(api: Api<K>, name: &str, cond: impl Condition<K>) -> Result<Option<K>, Error>
where
    K: Clone + Debug + Send + DeserializeOwned + Serialize + Resource + 'static,
{
    // Skip updates until the condition is satisfied.
    let mut stream = std::pin::pin!(watch_object(api, name).try_skip_while(|obj| {
        let matches = cond.matches_object(obj.as_ref());
        futures::future::ok(!matches)
    }));

    // Then take the first update that satisfies the condition.
    let obj = stream.try_next().await.map_err(Error::ProbeFailed)?.flatten();
    Ok(obj)
}

/// A trait for condition functions to be used by [`await_condition`]
///
/// Note that this is auto-implemented for functions of type `fn(Option<&K>) -> bool`.
///
/// # Usage
///
/// ```
/// use addon_core::{conditions, v1alpha1::FluxAddonInstance};
/// use addon_runtime::wait::Condition;
/// fn has_true_condition(type_: &str) -> impl Condition<FluxAddonInstance> + '_ {
///     move |obj: Option<&FluxAddonInstance>| {
///         obj.is_some_and(|instance| conditions::is_true(instance.conditions(), type_))
///     }
/// }
/// ```
pub trait Condition<K: ?Sized> {
    /// Whether the (possibly missing) object satisfies the condition
    fn matches_object(&self, obj: Option<&K>) -> bool;

    /// Returns a `Condition` that holds if `self` does not
    ///
    /// # Usage
    ///
    /// ```rust
    /// # use addon_runtime::wait::Condition;
    /// let condition: fn(Option<&()>) -> bool = |_| true;
    /// assert!(condition.matches_object(None));
    /// assert!(!condition.not().matches_object(None));
    /// ```
    fn not(self) -> conditions::Not<Self>
    where
        Self: Sized,
    {
        conditions::Not(self)
    }

    /// Returns a `Condition` that holds if `self` and `other` both do
    ///
    /// # Usage
    ///
    /// ```rust
    /// # use addon_runtime::wait::Condition;
    /// let cond_false: fn(Option<&()>) -> bool = |_| false;
    /// let cond_true: fn(Option<&()>) -> bool = |_| true;
    /// assert!(!cond_false.and(cond_true).matches_object(None));
    /// assert!(cond_true.and(cond_true).matches_object(None));
    /// ```
    fn and<Other: Condition<K>>(self, other: Other) -> conditions::And<Self, Other>
    where
        Self: Sized,
    {
        conditions::And(self, other)
    }
}

impl<K: ?Sized, F: Fn(Option<&K>) -> bool> Condition<K> for F {
    fn matches_object(&self, obj: Option<&K>) -> bool {
        (self)(obj)
    }
}

/// Common conditions to wait for
pub mod conditions {
    pub use super::Condition;
    use addon_core::{conditions as status, v1alpha1::FluxAddonInstance, Resource};

    /// An await condition that returns `true` once the object has been deleted.
    ///
    /// An object is considered to be deleted if the object can no longer be found, or if its
    /// `uid` changes. This means that an object is considered to be deleted even if we miss
    /// the deletion event and the object is recreated in the meantime.
    #[must_use]
    pub fn is_deleted<K: Resource>(uid: &str) -> impl Condition<K> + '_ {
        move |obj: Option<&K>| {
            obj.map_or(
                // Object is not found, success!
                true,
                // Object is found, but a changed uid would mean that it was deleted and recreated
                |obj| obj.meta().uid.as_deref() != Some(uid),
            )
        }
    }

    /// An await condition that returns `true` if the object exists.
    ///
    /// NOTE: If waiting for an object to be deleted, do _not_ [invert](`Condition::not`) this [`Condition`].
    /// Instead, use [`is_deleted`], which considers a deleted-then-recreated object to have been deleted.
    #[must_use]
    pub fn exists<K>() -> impl Condition<K> {
        |obj: Option<&K>| obj.is_some()
    }

    /// An await condition for `FluxAddonInstance` that returns `true` once its agent reports ready
    #[must_use]
    pub fn is_instance_ready() -> impl Condition<FluxAddonInstance> {
        |obj: Option<&FluxAddonInstance>| obj.is_some_and(|i| status::is_true(i.conditions(), status::READY))
    }

    /// See [`Condition::not`]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Not<A>(pub(super) A);
    impl<A: Condition<K>, K> Condition<K> for Not<A> {
        fn matches_object(&self, obj: Option<&K>) -> bool {
            !self.0.matches_object(obj)
        }
    }

    /// See [`Condition::and`]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct And<A, B>(pub(super) A, pub(super) B);
    impl<A, B, K> Condition<K> for And<A, B>
    where
        A: Condition<K>,
        B: Condition<K>,
    {
        fn matches_object(&self, obj: Option<&K>) -> bool {
            self.0.matches_object(obj) && self.1.matches_object(obj)
        }
    }
}
