//! Contains the untyped object representation that store backends operate on.
use crate::{
    metadata::{ObjectMeta, TypeMeta},
    resource::Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to convert between DynamicObject and a typed resource: {source}")]
/// Failed to convert a `DynamicObject` from or into a typed `Resource`
pub struct ParseDynamicObjectError {
    #[from]
    source: serde_json::Error,
}

/// A dynamic representation of a stored object
///
/// Backends never see typed resources. `spec`, `status` and anything else
/// besides the type fields and metadata end up in `data`.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a DynamicObject of the given kind with only a name set
    #[must_use]
    pub fn new(name: &str, api_version: &str, kind: &str) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// The kind of the object, empty when the type fields are missing
    pub fn kind(&self) -> &str {
        self.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default()
    }

    /// Look up a top level field of `data`, such as `spec` or `status`
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Convert a typed resource into its dynamic form, filling in the type fields
    pub fn from_resource<K: Resource + Serialize>(obj: &K) -> Result<Self, ParseDynamicObjectError> {
        let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        dynamic.types = Some(TypeMeta {
            api_version: K::API_VERSION.to_string(),
            kind: K::KIND.to_string(),
        });
        Ok(dynamic)
    }

    /// Attempt to convert this `DynamicObject` to a `Resource`
    pub fn try_parse<K: Resource + DeserializeOwned>(self) -> Result<K, ParseDynamicObjectError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

#[cfg(test)]
mod test {
    use super::DynamicObject;
    use crate::{
        cluster::{Cluster, ClusterSpec},
        metadata::ObjectMeta,
        resource::ResourceExt,
    };

    #[test]
    fn typed_resources_convert_through_dynamic_objects() {
        let cluster = Cluster {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                namespace: Some("ns1".into()),
                labels: [("env".to_string(), "prod".to_string())].into(),
                ..Default::default()
            },
            spec: ClusterSpec { paused: true },
        };
        let dynamic = DynamicObject::from_resource(&cluster).unwrap();
        assert_eq!(dynamic.kind(), "Cluster");
        assert_eq!(dynamic.field("spec").unwrap()["paused"], true);

        let parsed: Cluster = dynamic.try_parse().unwrap();
        assert_eq!(parsed.labels().get("env").map(String::as_str), Some("prod"));
        assert!(parsed.spec.paused);
    }

    #[test]
    fn builder_sets_name_and_namespace() {
        let obj = DynamicObject::new("c1", "cluster.x-k8s.io/v1beta1", "Cluster")
            .within("ns1")
            .data(serde_json::json!({ "spec": { "paused": false } }));
        let yaml = serde_yaml::to_string(&obj).unwrap();
        assert!(yaml.contains("kind: Cluster"));
        assert!(yaml.contains("namespace: ns1"));
        assert!(yaml.contains("paused: false"));
    }
}
