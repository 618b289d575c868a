//! Common components for building controllers on top of the addon object store
//!
//! The main entry point is [`Controller`]: it keeps a [`reflector`] cache of the
//! reconciled kind, turns store events into deduplicated, delayed reconcile requests via the
//! [`scheduler`], and runs the reconciler with bounded concurrency, at most once per object
//! at any time.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod controller;
pub mod finalizer;
pub mod reflector;
pub mod scheduler;
pub mod utils;
pub mod wait;
pub mod watcher;

pub use controller::{applier, Config, Controller};
pub use finalizer::finalizer;
pub use reflector::reflector;
pub use scheduler::scheduler;
pub use utils::WatchStreamExt;
pub use watcher::watcher;
