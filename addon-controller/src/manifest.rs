//! Seeding the store from multi-document YAML manifests
//!
//! The standalone binary has no external object store, so addons and clusters are read from
//! the files listed under `manifests` in the configuration. Documents are dispatched on their
//! `kind`; objects without a namespace land in [`DEFAULT_NAMESPACE`].
use addon_client::{Api, Client};
use addon_core::{
    cluster::Cluster,
    v1alpha1::{FluxAddon, FluxAddonInstance},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// Namespace of manifest objects that do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Failures loading manifests
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file could not be read
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        /// The file
        path: PathBuf,
        /// The underlying failure
        #[source]
        source: std::io::Error,
    },
    /// A document is not valid YAML, or does not fit its kind
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A document lacks the `kind` field
    #[error("manifest document has no kind")]
    MissingKind,
    /// A document has a kind this controller does not know
    #[error("unsupported kind {0:?}")]
    UnknownKind(String),
    /// Storing an object failed
    #[error("failed to store {kind} {name:?}: {source}")]
    Store {
        /// Kind of the object
        kind: &'static str,
        /// Name of the object
        name: String,
        /// The underlying failure
        #[source]
        source: addon_client::Error,
    },
}

/// A single object read from a manifest
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// A `FluxAddon`
    Addon(FluxAddon),
    /// A `FluxAddonInstance`, mostly useful to stage adoption scenarios
    Instance(FluxAddonInstance),
    /// A `Cluster`
    Cluster(Cluster),
}

/// Parse every document of `input`, skipping empty ones
pub fn parse(input: &str) -> Result<Vec<Manifest>, ManifestError> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .ok_or(ManifestError::MissingKind)?
            .to_string();
        let manifest = if kind == FluxAddon::KIND {
            Manifest::Addon(serde_yaml::from_value(value)?)
        } else if kind == FluxAddonInstance::KIND {
            Manifest::Instance(serde_yaml::from_value(value)?)
        } else if kind == Cluster::KIND {
            Manifest::Cluster(serde_yaml::from_value(value)?)
        } else {
            return Err(ManifestError::UnknownKind(kind));
        };
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Create the objects, leaving existing ones alone
///
/// Returns how many objects were created.
pub async fn seed(client: &Client, manifests: Vec<Manifest>) -> Result<usize, ManifestError> {
    let mut created = 0;
    for manifest in manifests {
        let was_created = match manifest {
            Manifest::Addon(obj) => create(client, obj).await?,
            Manifest::Instance(obj) => create(client, obj).await?,
            Manifest::Cluster(obj) => create(client, obj).await?,
        };
        created += usize::from(was_created);
    }
    Ok(created)
}

/// Read, parse and seed every file in `paths`, in order
pub async fn load(client: &Client, paths: &[PathBuf]) -> Result<usize, ManifestError> {
    let mut created = 0;
    for path in paths {
        let manifests = parse(&read(path)?)?;
        debug!(path = %path.display(), objects = manifests.len(), "parsed manifest");
        created += seed(client, manifests).await?;
    }
    Ok(created)
}

fn read(path: &Path) -> Result<String, ManifestError> {
    std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_owned(),
        source,
    })
}

async fn create<K>(client: &Client, mut obj: K) -> Result<bool, ManifestError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
{
    let namespace = obj
        .meta_mut()
        .namespace
        .get_or_insert_with(|| DEFAULT_NAMESPACE.to_string())
        .clone();
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    match api.create(&obj).await {
        Ok(created) => {
            info!(kind = K::KIND, name = %created.name_any(), %namespace, "seeded object");
            Ok(true)
        }
        Err(addon_client::Error::AlreadyExists { .. }) => {
            debug!(kind = K::KIND, name = %obj.name_any(), %namespace, "object exists, not seeding");
            Ok(false)
        }
        Err(source) => Err(ManifestError::Store {
            kind: K::KIND,
            name: obj.name_any(),
            source,
        }),
    }
}
