use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use addon_core::{DynamicObject, ListParams, WatchEvent};
use async_trait::async_trait;
use chrono::Utc;
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Backend, EventStream};
use crate::{Error, Result};

/// Store operations, as recorded in the request log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    /// [`Backend::get`]
    Get,
    /// [`Backend::list`]
    List,
    /// [`Backend::create`]
    Create,
    /// [`Backend::replace`]
    Replace,
    /// [`Backend::replace_status`]
    ReplaceStatus,
    /// [`Backend::delete`]
    Delete,
    /// [`Backend::watch`]
    Watch,
}

impl Verb {
    /// Whether the verb writes to the store
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Verb::Create | Verb::Replace | Verb::ReplaceStatus | Verb::Delete
        )
    }
}

/// A request as seen by a [`MemoryBackend`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// Operation
    pub verb: Verb,
    /// Kind addressed
    pub kind: String,
    /// Namespace addressed, `None` for requests across namespaces
    pub namespace: Option<String>,
    /// Name addressed, `None` for collection requests
    pub name: Option<String>,
}

/// A failure to inject into the next matching request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`Error::Unavailable`]
    Unavailable,
    /// Fail with [`Error::Conflict`], as if another writer got there first
    Conflict,
}

type Key = (String, Option<String>, String);

struct Watcher {
    kind: String,
    namespace: Option<String>,
    tx: mpsc::UnboundedSender<Result<WatchEvent<DynamicObject>>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    last_version: u64,
    last_uid: u64,
    watchers: Vec<Watcher>,
    faults: HashMap<(Verb, String), VecDeque<Fault>>,
    log: Vec<Request>,
}

/// An in-memory object store
///
/// Implements the full write semantics the controllers rely on: monotonically increasing
/// `resourceVersion`s checked on every update, a status subresource, generation tracking
/// and finalizer-guarded deletion. Clones share the same store.
///
/// Every request is recorded, and failures can be injected per verb and kind.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `verb` request on `kind` fail with `fault`
    ///
    /// Faults queue up, each one is consumed by exactly one request.
    pub fn inject_fault(&self, verb: Verb, kind: &str, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry((verb, kind.to_string()))
            .or_default()
            .push_back(fault);
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    /// Number of write requests received so far
    pub fn mutations(&self) -> usize {
        self.state.lock().log.iter().filter(|r| r.verb.is_mutation()).count()
    }

    /// Number of requests of a verb on a kind received so far
    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.verb == verb && r.kind == kind)
            .count()
    }

    /// Forget the request log
    pub fn clear_requests(&self) {
        self.state.lock().log.clear();
    }

    /// A snapshot of every stored object of a kind
    pub fn objects(&self, kind: &str) -> Vec<DynamicObject> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }
}

impl State {
    fn record(&mut self, verb: Verb, kind: &str, namespace: Option<&str>, name: Option<&str>) -> Result<()> {
        self.log.push(Request {
            verb,
            kind: kind.to_string(),
            namespace: namespace.map(String::from),
            name: name.map(String::from),
        });
        let fault = self
            .faults
            .get_mut(&(verb, kind.to_string()))
            .and_then(VecDeque::pop_front);
        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(Error::Unavailable(format!("injected failure on {verb:?} {kind}"))),
            Some(Fault::Conflict) => Err(Error::Conflict {
                kind: kind.to_string(),
                name: name.unwrap_or_default().to_string(),
                message: "the object has been modified; please apply your changes to the latest version".into(),
            }),
        }
    }

    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    fn broadcast(&mut self, event: WatchEvent<DynamicObject>) {
        let obj = event.object();
        let kind = obj.kind().to_string();
        let namespace = obj.metadata.namespace.clone();
        self.watchers.retain(|w| {
            if w.kind != kind || (w.namespace.is_some() && w.namespace != namespace) {
                return !w.tx.is_closed();
            }
            w.tx.unbounded_send(Ok(event.clone())).is_ok()
        });
    }

    /// Look up the stored version of an object that is about to be overwritten
    fn current_for_write(&self, obj: &DynamicObject) -> Result<(Key, &DynamicObject)> {
        let kind = obj.kind().to_string();
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Invalid("metadata.name is required".into()))?;
        let key = (kind.clone(), obj.metadata.namespace.clone(), name.clone());
        let current = self.objects.get(&key).ok_or(Error::NotFound {
            kind: kind.clone(),
            name: name.clone(),
        })?;
        if obj.metadata.resource_version.is_none() || obj.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::Conflict {
                kind,
                name,
                message: format!(
                    "resourceVersion {:?} does not match the stored {:?}",
                    obj.metadata.resource_version, current.metadata.resource_version
                ),
            });
        }
        Ok((key, current))
    }

    /// Store an updated object, or drop it when its finalizers are gone while deleting
    fn commit(&mut self, key: Key, mut updated: DynamicObject) -> DynamicObject {
        if self.objects.get(&key) == Some(&updated) {
            trace!(kind = %key.0, name = %key.2, "write changed nothing");
            return updated;
        }
        updated.metadata.resource_version = Some(self.next_version());
        if updated.metadata.deletion_timestamp.is_some() && updated.metadata.finalizers.is_empty() {
            debug!(kind = %key.0, name = %key.2, "last finalizer removed, deleting");
            self.objects.remove(&key);
            self.broadcast(WatchEvent::Deleted(updated.clone()));
        } else {
            self.objects.insert(key, updated.clone());
            self.broadcast(WatchEvent::Modified(updated.clone()));
        }
        updated
    }
}

fn split_status(data: &serde_json::Value) -> (serde_json::Value, Option<serde_json::Value>) {
    let mut rest = data.clone();
    let status = rest.as_object_mut().and_then(|m| m.remove("status"));
    (rest, status)
}

fn with_status(mut data: serde_json::Value, status: Option<serde_json::Value>) -> serde_json::Value {
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
        if let Some(status) = status {
            map.insert("status".into(), status);
        }
    }
    data
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.record(Verb::Get, kind, namespace, Some(name))?;
        let key = (kind.to_string(), namespace.map(String::from), name.to_string());
        state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, lp: &ListParams) -> Result<Vec<DynamicObject>> {
        let mut state = self.state.lock();
        state.record(Verb::List, kind, namespace, None)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, obj)| lp.matches(&obj.metadata.labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        let kind = obj.kind().to_string();
        let namespace = obj.metadata.namespace.clone();
        state.record(Verb::Create, &kind, namespace.as_deref(), obj.metadata.name.as_deref())?;
        if kind.is_empty() {
            return Err(Error::Invalid("kind is required".into()));
        }
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Invalid("metadata.name is required".into()))?;
        let key = (kind.clone(), namespace, name.clone());
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists { kind, name });
        }

        state.last_uid += 1;
        obj.metadata.uid = Some(format!("{:08x}-0000-4000-8000-{:012x}", state.last_uid, state.last_uid));
        obj.metadata.resource_version = Some(state.next_version());
        obj.metadata.generation = Some(1);
        obj.metadata.creation_timestamp = Some(Utc::now());
        obj.metadata.deletion_timestamp = None;
        obj.data = with_status(obj.data, None);

        debug!(%kind, %name, "created");
        state.objects.insert(key, obj.clone());
        state.broadcast(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn replace(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.record(
            Verb::Replace,
            obj.kind(),
            obj.metadata.namespace.as_deref(),
            obj.metadata.name.as_deref(),
        )?;
        let (key, current) = state.current_for_write(&obj)?;

        let deleting = current.metadata.deletion_timestamp.is_some();
        if deleting
            && obj
                .metadata
                .finalizers
                .iter()
                .any(|f| !current.metadata.finalizers.contains(f))
        {
            return Err(Error::Invalid(format!(
                "{} {:?} is being deleted, no new finalizers may be added",
                key.0, key.2
            )));
        }

        let (new_spec, _) = split_status(&obj.data);
        let (old_spec, old_status) = split_status(&current.data);
        let mut updated = current.clone();
        updated.metadata.labels = obj.metadata.labels;
        updated.metadata.annotations = obj.metadata.annotations;
        updated.metadata.finalizers = obj.metadata.finalizers;
        updated.metadata.owner_references = obj.metadata.owner_references;
        if new_spec != old_spec {
            updated.metadata.generation = Some(current.metadata.generation.unwrap_or_default() + 1);
        }
        updated.data = with_status(new_spec, old_status);
        Ok(state.commit(key, updated))
    }

    async fn replace_status(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.record(
            Verb::ReplaceStatus,
            obj.kind(),
            obj.metadata.namespace.as_deref(),
            obj.metadata.name.as_deref(),
        )?;
        let (key, current) = state.current_for_write(&obj)?;
        let (_, new_status) = split_status(&obj.data);
        let mut updated = current.clone();
        updated.data = with_status(updated.data, new_status);
        Ok(state.commit(key, updated))
    }

    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        let mut state = self.state.lock();
        state.record(Verb::Delete, kind, namespace, Some(name))?;
        let key = (kind.to_string(), namespace.map(String::from), name.to_string());
        let current = state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        })?;

        if current.metadata.finalizers.is_empty() {
            debug!(%kind, %name, "deleted");
            state.objects.remove(&key);
            state.broadcast(WatchEvent::Deleted(current));
            return Ok(None);
        }
        if current.metadata.deletion_timestamp.is_some() {
            return Ok(Some(current));
        }
        debug!(%kind, %name, finalizers = ?current.metadata.finalizers, "deletion pending on finalizers");
        let mut updated = current;
        updated.metadata.deletion_timestamp = Some(Utc::now());
        Ok(Some(state.commit(key, updated)))
    }

    async fn watch(&self, kind: &str, namespace: Option<&str>) -> Result<EventStream> {
        let mut state = self.state.lock();
        state.record(Verb::Watch, kind, namespace, None)?;
        let (tx, rx) = mpsc::unbounded();
        state.watchers.push(Watcher {
            kind: kind.to_string(),
            namespace: namespace.map(String::from),
            tx,
        });
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{poll, StreamExt};
    use serde_json::json;

    fn cluster(name: &str, env: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, "cluster.x-k8s.io/v1beta1", "Cluster")
            .within("ns1")
            .data(json!({ "spec": { "paused": false } }));
        obj.metadata.labels.insert("env".into(), env.into());
        obj
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemoryBackend::new();
        let created = store.create(cluster("c1", "prod")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.resource_version.is_some());

        let err = store.create(cluster("c1", "prod")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn stale_versions_conflict() {
        let store = MemoryBackend::new();
        let created = store.create(cluster("c1", "prod")).await.unwrap();

        let mut first = created.clone();
        first.metadata.labels.insert("env".into(), "dev".into());
        let updated = store.replace(first).await.unwrap();
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);

        let mut second = created;
        second.metadata.labels.insert("tier".into(), "edge".into());
        assert!(store.replace(second).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn replace_keeps_status_and_bumps_generation_on_spec_change() {
        let store = MemoryBackend::new();
        let created = store.create(cluster("c1", "prod")).await.unwrap();

        let mut with_status = created.clone();
        with_status.data["status"] = json!({ "phase": "Provisioned" });
        let after_status = store.replace_status(with_status).await.unwrap();
        assert_eq!(after_status.metadata.generation, Some(1));

        let mut spec_change = after_status.clone();
        spec_change.data = json!({ "spec": { "paused": true }, "status": { "phase": "Ignored" } });
        let replaced = store.replace(spec_change).await.unwrap();
        assert_eq!(replaced.metadata.generation, Some(2));
        assert_eq!(replaced.data["status"]["phase"], "Provisioned");
        assert_eq!(replaced.data["spec"]["paused"], true);
    }

    #[tokio::test]
    async fn unchanged_writes_keep_the_version() {
        let store = MemoryBackend::new();
        let created = store.create(cluster("c1", "prod")).await.unwrap();
        let same = store.replace(created.clone()).await.unwrap();
        assert_eq!(same.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_cleared() {
        let store = MemoryBackend::new();
        let mut obj = cluster("c1", "prod");
        obj.metadata.finalizers.push("example.com/cleanup".into());
        store.create(obj).await.unwrap();

        let terminating = store.delete("Cluster", Some("ns1"), "c1").await.unwrap().unwrap();
        assert!(terminating.metadata.deletion_timestamp.is_some());

        let mut readd = terminating.clone();
        readd.metadata.finalizers.push("example.com/other".into());
        assert!(matches!(store.replace(readd).await, Err(Error::Invalid(_))));

        let mut cleared = terminating;
        cleared.metadata.finalizers.clear();
        store.replace(cleared).await.unwrap();
        let err = store.get("Cluster", Some("ns1"), "c1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemoryBackend::new();
        store.create(cluster("c1", "prod")).await.unwrap();
        store.create(cluster("c2", "dev")).await.unwrap();
        store.create(cluster("c3", "prod").within("ns2")).await.unwrap();

        let lp = ListParams::default().labels("env=prod").unwrap();
        let names = |objs: Vec<DynamicObject>| {
            objs.into_iter().filter_map(|o| o.metadata.name).collect::<Vec<_>>()
        };
        assert_eq!(names(store.list("Cluster", Some("ns1"), &lp).await.unwrap()), vec!["c1"]);
        assert_eq!(names(store.list("Cluster", None, &lp).await.unwrap()), vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn watchers_see_changes_in_order() {
        let store = MemoryBackend::new();
        let mut events = store.watch("Cluster", Some("ns1")).await.unwrap();
        let created = store.create(cluster("c1", "prod")).await.unwrap();
        store.create(cluster("c9", "prod").within("other")).await.unwrap();
        store.delete("Cluster", Some("ns1"), "c1").await.unwrap();

        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Added(o))) if o == created));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Deleted(_)))));
        assert!(poll!(events.next()).is_pending());
    }

    #[tokio::test]
    async fn injected_faults_fire_once_and_are_logged() {
        let store = MemoryBackend::new();
        store.inject_fault(Verb::List, "Cluster", Fault::Unavailable);
        let lp = ListParams::default();
        assert!(store.list("Cluster", None, &lp).await.unwrap_err().is_transient());
        assert!(store.list("Cluster", None, &lp).await.is_ok());

        store.create(cluster("c1", "prod")).await.unwrap();
        assert_eq!(store.count(Verb::List, "Cluster"), 2);
        assert_eq!(store.mutations(), 1);
        store.clear_requests();
        assert!(store.requests().is_empty());
    }
}
