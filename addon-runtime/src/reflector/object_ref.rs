use addon_core::{metadata::ObjectMeta, ObjectReference, OwnerReference, Resource, ResourceExt};
use educe::Educe;
use std::{
    fmt::{Debug, Display},
    marker::PhantomData,
};

/// A typed and namespaced (if relevant) reference to an object of kind `K`
///
/// Used as the key of reflector caches and as the message type of the scheduler.
///
/// ```
/// use addon_core::cluster::Cluster;
/// use addon_runtime::reflector::ObjectRef;
/// assert_ne!(
///     ObjectRef::<Cluster>::new("c1"),
///     ObjectRef::<Cluster>::new("c1").within("ns1"),
/// );
/// ```
#[derive(Educe)]
#[educe(Debug(bound()), PartialEq(bound()), Hash(bound()), Clone(bound()))]
#[non_exhaustive]
pub struct ObjectRef<K> {
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    pub namespace: Option<String>,
    /// Extra information about the object being referred to
    ///
    /// This is *not* considered when comparing objects.
    #[educe(Hash(ignore), PartialEq(ignore))]
    pub extra: Extra,
    #[educe(Debug(ignore))]
    _kind: PhantomData<fn() -> K>,
}

impl<K> Eq for ObjectRef<K> {}

/// Non-vital information about an object being referred to
///
/// See [`ObjectRef::extra`].
#[derive(Default, Debug, Clone)]
#[non_exhaustive]
pub struct Extra {
    /// The version of the resource at the time of reference
    pub resource_version: Option<String>,
    /// The uid of the object
    pub uid: Option<String>,
}

impl<K> ObjectRef<K> {
    /// A reference to an object without a namespace
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            extra: Extra::default(),
            _kind: PhantomData,
        }
    }

    /// Put the reference into a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }
}

impl<K: Resource> ObjectRef<K> {
    /// Creates `ObjectRef` from the resource
    #[must_use]
    pub fn from_obj(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            name: obj.name_any(),
            namespace: meta.namespace.clone(),
            extra: Extra::from_obj_meta(meta),
            _kind: PhantomData,
        }
    }

    /// Create an `ObjectRef` from an `OwnerReference`, if the owner is of kind `K`
    ///
    /// Owners always live in the namespace of the objects they own.
    #[must_use]
    pub fn from_owner_ref(namespace: Option<&str>, owner: &OwnerReference) -> Option<Self> {
        (owner.kind == K::KIND).then(|| Self {
            name: owner.name.clone(),
            namespace: namespace.map(String::from),
            extra: Extra {
                resource_version: None,
                uid: Some(owner.uid.clone()),
            },
            _kind: PhantomData,
        })
    }
}

impl<K: Resource> Display for ObjectRef<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", K::KIND, self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

impl<K: Resource> From<ObjectRef<K>> for ObjectReference {
    fn from(val: ObjectRef<K>) -> Self {
        ObjectReference {
            api_version: Some(K::API_VERSION.to_string()),
            kind: Some(K::KIND.to_string()),
            name: val.name,
            namespace: val.namespace,
        }
    }
}

impl Extra {
    fn from_obj_meta(obj_meta: &ObjectMeta) -> Self {
        Self {
            resource_version: obj_meta.resource_version.clone(),
            uid: obj_meta.uid.clone(),
        }
    }
}
