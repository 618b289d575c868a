use futures::{future, StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tracing::instrument;

use crate::{api::Api, Error, Result};
use addon_core::{dynamic::DynamicObject, params::ListParams, Resource, WatchEvent};
use futures::stream::BoxStream;

/// GET/LIST/POST/PUT/DELETE abstractions
impl<K> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
{
    /// Get a named resource
    ///
    /// # Errors
    ///
    /// This function assumes that the object is expected to always exist, and returns [`Error::NotFound`] if it does not.
    /// Consider using [`Api::get_opt`] if you need to handle missing objects.
    #[instrument(skip(self), fields(kind = K::KIND))]
    pub async fn get(&self, name: &str) -> Result<K> {
        let obj = self.client.backend().get(K::KIND, self.namespace(), name).await?;
        Ok(obj.try_parse()?)
    }

    /// [Get](`Api::get`) a named resource if it exists, returns [`None`] if it doesn't exist
    pub async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Get a list of resources
    #[instrument(skip(self), fields(kind = K::KIND))]
    pub async fn list(&self, lp: &ListParams) -> Result<Vec<K>> {
        let objs = self.client.backend().list(K::KIND, self.namespace(), lp).await?;
        objs.into_iter()
            .map(|o| o.try_parse().map_err(Error::from))
            .collect()
    }

    /// Create a resource
    ///
    /// An object without a namespace is created in the namespace of the Api.
    #[instrument(skip(self, data), fields(kind = K::KIND))]
    pub async fn create(&self, data: &K) -> Result<K> {
        let mut obj = DynamicObject::from_resource(data)?;
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = self.namespace.clone();
        }
        let created = self.client.backend().create(obj).await?;
        Ok(created.try_parse()?)
    }

    /// Replace everything except the status of a resource
    ///
    /// The `metadata.resourceVersion` of `data` must match the stored one.
    #[instrument(skip(self, data), fields(kind = K::KIND))]
    pub async fn replace(&self, name: &str, data: &K) -> Result<K> {
        let obj = self.prepare_write(name, data)?;
        let replaced = self.client.backend().replace(obj).await?;
        Ok(replaced.try_parse()?)
    }

    /// Replace the status of a resource, ignoring everything else
    ///
    /// The `metadata.resourceVersion` of `data` must match the stored one.
    #[instrument(skip(self, data), fields(kind = K::KIND))]
    pub async fn replace_status(&self, name: &str, data: &K) -> Result<K> {
        let obj = self.prepare_write(name, data)?;
        let replaced = self.client.backend().replace_status(obj).await?;
        Ok(replaced.try_parse()?)
    }

    /// Delete a named resource
    ///
    /// Returns the object when its finalizers keep it around, `None` when it is gone.
    #[instrument(skip(self), fields(kind = K::KIND))]
    pub async fn delete(&self, name: &str) -> Result<Option<K>> {
        let remaining = self.client.backend().delete(K::KIND, self.namespace(), name).await?;
        remaining.map(|o| o.try_parse().map_err(Error::from)).transpose()
    }

    /// Watch a list of resources
    ///
    /// Objects that do not pass the label filter are dropped. An object modified so that it
    /// no longer passes is reported as deleted.
    pub async fn watch(&self, lp: &ListParams) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let lp = lp.clone();
        let events = self.client.backend().watch(K::KIND, self.namespace()).await?;
        Ok(events
            .try_filter_map(move |event| {
                let passes = lp.matches(&event.object().metadata.labels);
                let event = match event {
                    WatchEvent::Modified(o) if !passes => Some(WatchEvent::Deleted(o)),
                    event if passes => Some(event),
                    _ => None,
                };
                future::ready(
                    event
                        .map(|e| e.try_map(|o| o.try_parse::<K>()).map_err(Error::from))
                        .transpose(),
                )
            })
            .boxed())
    }

    fn prepare_write(&self, name: &str, data: &K) -> Result<DynamicObject> {
        let mut obj = DynamicObject::from_resource(data)?;
        match &obj.metadata.name {
            Some(n) if n != name => {
                return Err(Error::Invalid(format!(
                    "name {n:?} in the object does not match {name:?}"
                )));
            }
            Some(_) => {}
            None => obj.metadata.name = Some(name.to_string()),
        }
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = self.namespace.clone();
        }
        Ok(obj)
    }
}
