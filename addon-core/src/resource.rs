use crate::{
    metadata::{ObjectMeta, OwnerReference},
    object::ObjectReference,
};
use std::collections::BTreeMap;

/// An accessor trait for a persisted kind
///
/// Every object the store manages carries [`ObjectMeta`] and is identified by a static kind.
pub trait Resource {
    /// The kind, as used for store lookups and owner references
    const KIND: &'static str;
    /// The apiVersion of the kind
    const API_VERSION: &'static str;

    /// Metadata that all persisted resources must have
    fn meta(&self) -> &ObjectMeta;
    /// Metadata that all persisted resources must have
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Generates an object reference for the resource
    fn object_ref(&self) -> ObjectReference {
        let meta = self.meta();
        ObjectReference {
            api_version: Some(Self::API_VERSION.to_string()),
            kind: Some(Self::KIND.to_string()),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
        }
    }

    /// Generates a controller owner reference pointing to this resource
    ///
    /// Returns `None` for objects that were never persisted, since they lack a name or uid.
    fn controller_owner_ref(&self) -> Option<OwnerReference> {
        let meta = self.meta();
        Some(OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
            controller: Some(true),
        })
    }
}

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the name of the resource, or an empty string for unnamed local objects
    fn name_any(&self) -> String;
    /// The namespace the resource is in
    fn namespace(&self) -> Option<String>;
    /// The resource version
    fn resource_version(&self) -> Option<String>;
    /// Unique ID (if you delete resource and then create a new
    /// resource with the same name, it will have different ID)
    fn uid(&self) -> Option<String>;
    /// Returns resource labels
    fn labels(&self) -> &BTreeMap<String, String>;
    /// Provides mutable access to the labels
    fn labels_mut(&mut self) -> &mut BTreeMap<String, String>;
    /// Returns resource annotations
    fn annotations(&self) -> &BTreeMap<String, String>;
    /// Returns resource owner references
    fn owner_references(&self) -> &[OwnerReference];
    /// Returns resource finalizers
    fn finalizers(&self) -> &[String];
    /// Provides mutable access to the finalizers
    fn finalizers_mut(&mut self) -> &mut Vec<String>;
    /// Whether deletion was requested and the object is only kept alive by its finalizers
    fn is_deleting(&self) -> bool;
    /// Whether `owner` is listed as an owner of this object
    ///
    /// Matches on uid when both sides have one, so that a recreated owner does not adopt
    /// the children of its predecessor.
    fn is_owned_by<O: Resource>(&self, owner: &O) -> bool;
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.meta_mut().labels
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        &self.meta().annotations
    }

    fn owner_references(&self) -> &[OwnerReference] {
        &self.meta().owner_references
    }

    fn finalizers(&self) -> &[String] {
        &self.meta().finalizers
    }

    fn finalizers_mut(&mut self) -> &mut Vec<String> {
        &mut self.meta_mut().finalizers
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn is_owned_by<O: Resource>(&self, owner: &O) -> bool {
        let owner_meta = owner.meta();
        self.owner_references().iter().any(|r| {
            r.kind == O::KIND
                && Some(&r.name) == owner_meta.name.as_ref()
                && owner_meta.uid.as_ref().map_or(true, |uid| uid == &r.uid)
        })
    }
}

/// Implements [`Resource`] for a struct with a `metadata: ObjectMeta` field
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $kind:literal, $api_version:literal) => {
        impl $crate::Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
