//! Crate for talking to the object store backing the flux addon controller
//!
//! Store access goes through a [`Client`], a cheap handle around an injected
//! [`Backend`]. Typed access to one kind goes through [`Api`]:
//!
//! ```rust
//! use addon_client::{client::MemoryBackend, Api, Client};
//! use addon_core::{cluster::Cluster, ListParams};
//!
//! # async fn wrapper() -> Result<(), addon_client::Error> {
//! let client = Client::new(MemoryBackend::new());
//! let clusters: Api<Cluster> = Api::namespaced(client, "fleet");
//! for cluster in clusters.list(&ListParams::default()).await? {
//!     println!("found cluster {:?}", cluster.metadata.name);
//! }
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub use api::Api;

pub mod client;
pub use client::{Backend, Client, Fault, MemoryBackend, Verb};

pub mod error;
pub use error::Error;

/// Re-exports from addon-core
pub use addon_core as core;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
