//! Read-modify-write helpers that retry optimistic concurrency conflicts
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{Api, Result};
use addon_core::{Resource, ResourceExt};

#[derive(Clone, Copy, Debug)]
enum Target {
    Object,
    Status,
}

impl<K> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + PartialEq + Send + 'static,
{
    /// Apply `f` to an object and write the result back
    ///
    /// The first attempt starts from `obj`, typically a cached copy. When the write conflicts,
    /// the object is fetched again and `f` is reapplied, at most `retries` times. Nothing is
    /// written when `f` leaves the object unchanged.
    ///
    /// Returns the object as stored after the call.
    pub async fn modify(&self, obj: &K, retries: u32, f: impl FnMut(&mut K)) -> Result<K> {
        self.modify_target(obj, retries, f, Target::Object).await
    }

    /// Like [`Api::modify`], but only the status of the result is written
    pub async fn modify_status(&self, obj: &K, retries: u32, f: impl FnMut(&mut K)) -> Result<K> {
        self.modify_target(obj, retries, f, Target::Status).await
    }

    async fn modify_target(
        &self,
        obj: &K,
        retries: u32,
        mut f: impl FnMut(&mut K),
        target: Target,
    ) -> Result<K> {
        let api = match (self.namespace(), obj.namespace()) {
            (None, Some(ns)) => Api::namespaced(self.client.clone(), &ns),
            _ => self.clone(),
        };
        let name = obj.name_any();
        let mut current = obj.clone();
        let mut attempt = 0;
        loop {
            let mut desired = current.clone();
            f(&mut desired);
            if desired == current {
                return Ok(current);
            }
            let written = match target {
                Target::Object => api.replace(&name, &desired).await,
                Target::Status => api.replace_status(&name, &desired).await,
            };
            match written {
                Err(err) if err.is_conflict() && attempt < retries => {
                    attempt += 1;
                    debug!(kind = K::KIND, %name, attempt, ?target, "write conflicted, refetching");
                    current = api.get(&name).await?;
                }
                written => return written,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        client::{Fault, MemoryBackend, Verb},
        Api, Client,
    };
    use addon_core::{
        cluster::{Cluster, ClusterSpec},
        ObjectMeta, ResourceExt,
    };

    fn cluster(name: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: ClusterSpec::default(),
        }
    }

    #[tokio::test]
    async fn modify_retries_conflicts_from_fresh_state() {
        let store = MemoryBackend::new();
        let api: Api<Cluster> = Api::namespaced(Client::new(store.clone()), "ns1");
        let stale = api.create(&cluster("c1")).await.unwrap();

        // someone else relabels the cluster behind our back
        let mut other = stale.clone();
        other.labels_mut().insert("owner".into(), "someone".into());
        api.replace("c1", &other).await.unwrap();

        let modified = api
            .modify(&stale, 3, |c| {
                c.labels_mut().insert("env".into(), "prod".into());
            })
            .await
            .unwrap();
        assert_eq!(modified.labels().get("env").unwrap(), "prod");
        assert_eq!(modified.labels().get("owner").unwrap(), "someone");
        assert_eq!(store.count(Verb::Get, "Cluster"), 1);
    }

    #[tokio::test]
    async fn modify_gives_up_after_retries() {
        let store = MemoryBackend::new();
        let api: Api<Cluster> = Api::namespaced(Client::new(store.clone()), "ns1");
        let c1 = api.create(&cluster("c1")).await.unwrap();
        for _ in 0..2 {
            store.inject_fault(Verb::Replace, "Cluster", Fault::Conflict);
        }
        let err = api.modify(&c1, 1, |c| c.spec.paused = true).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn unchanged_objects_are_not_written() {
        let store = MemoryBackend::new();
        let all: Api<Cluster> = Api::all(Client::new(store.clone()));
        let api: Api<Cluster> = Api::namespaced(Client::new(store.clone()), "ns1");
        let c1 = api.create(&cluster("c1")).await.unwrap();
        store.clear_requests();

        let same = all.modify(&c1, 3, |c| c.spec.paused = false).await.unwrap();
        assert_eq!(same, c1);
        let paused = all.modify_status(&c1, 3, |c| c.spec.paused = true).await.unwrap();
        // the status write ignores the spec change
        assert!(!paused.spec.paused);
        assert_eq!(store.mutations(), 1);
    }
}
