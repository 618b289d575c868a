//! Crate with the types and traits shared by the flux addon controller
//!
//! This crate holds everything that does not need a store client: object metadata,
//! the [`Resource`] trait, label selectors, conditions and their aggregation, and the
//! persisted schema of the `FluxAddon`, `FluxAddonInstance` and `Cluster` kinds.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod conditions;
pub use conditions::{Condition, Severity};

pub mod cluster;

pub mod duration;
pub use duration::Duration;

pub mod dynamic;
pub use dynamic::DynamicObject;

pub mod labels;
pub use labels::{LabelSelector, Selector};

pub mod metadata;
pub use metadata::{ObjectMeta, OwnerReference, TypeMeta};

pub mod object;
pub use object::ObjectReference;

pub mod params;
pub use params::ListParams;

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod v1alpha1;

pub mod watch;
pub use watch::WatchEvent;
