//! In-memory resource store and event capture for controller tests
//!
//! [`MemoryApi`] emulates the parts of the API server the controllers rely
//! on: UIDs, monotonically increasing resource versions, optimistic
//! concurrency on writes, delete preconditions and equality label selectors.
//! It counts writes so tests can assert idempotence.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::events::{EventPublisher, EventSeverity, PendingEvent};
use crate::store::{DeletePreconditions, ObjectApi, StoreObject};
use crate::{Error, Result};

type Key = (Option<String>, String);

/// Write counters for a [`MemoryApi`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCounts {
    /// Successful creates
    pub creates: usize,
    /// Successful replaces
    pub replaces: usize,
    /// Successful status replaces
    pub status_writes: usize,
    /// Successful deletes
    pub deletes: usize,
    /// Writes rejected for a stale version or failed precondition
    pub conflicts: usize,
}

impl WriteCounts {
    /// Total successful writes of any kind
    pub fn total(&self) -> usize {
        self.creates + self.replaces + self.status_writes + self.deletes
    }
}

#[derive(Debug)]
struct State<K> {
    objects: BTreeMap<Key, K>,
    version: u64,
    counts: WriteCounts,
}

/// In-memory [`ObjectApi`] implementation
#[derive(Debug)]
pub struct MemoryApi<K> {
    state: Mutex<State<K>>,
}

impl<K: StoreObject> Default for MemoryApi<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of<K: StoreObject>(obj: &K) -> Key {
    (obj.meta().namespace.clone(), obj.name_any())
}

fn kind<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

fn matches_selector<K: StoreObject>(obj: &K, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).is_some_and(|actual| actual == v.trim()),
            None => labels.contains_key(term),
        })
}

impl<K: StoreObject> MemoryApi<K> {
    /// Empty store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                counts: WriteCounts::default(),
            }),
        }
    }

    /// Empty store behind an `Arc`, ready to hand to a context
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed an object without counting a write; returns the stored copy
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.state.lock();
        state.version += 1;
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.resource_version = Some(state.version.to_string());
        state.objects.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Modify a stored object as another writer would, bumping its version
    pub fn mutate(&self, namespace: Option<&str>, name: &str, f: impl FnOnce(&mut K)) -> Result<K> {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version;
        let key = (namespace.map(str::to_string), name.to_string());
        let obj = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(kind::<K>(), name))?;
        f(obj);
        obj.meta_mut().resource_version = Some(version.to_string());
        Ok(obj.clone())
    }

    /// Snapshot of a stored object
    pub fn stored(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = (namespace.map(str::to_string), name.to_string());
        self.state.lock().objects.get(&key).cloned()
    }

    /// All stored objects
    pub fn all(&self) -> Vec<K> {
        self.state.lock().objects.values().cloned().collect()
    }

    /// Write counters so far
    pub fn counts(&self) -> WriteCounts {
        self.state.lock().counts
    }

    fn write(&self, obj: &K, status_only: bool) -> Result<K> {
        let mut state = self.state.lock();
        let key = key_of(obj);
        let stored_version = match state.objects.get(&key) {
            Some(existing) => existing.meta().resource_version.clone(),
            None => return Err(Error::not_found(kind::<K>(), obj.name_any())),
        };
        if let Some(version) = obj.meta().resource_version.as_ref() {
            if Some(version) != stored_version.as_ref() {
                state.counts.conflicts += 1;
                return Err(Error::conflict(kind::<K>(), obj.name_any()));
            }
        }
        state.version += 1;
        let mut updated = obj.clone();
        updated.meta_mut().resource_version = Some(state.version.to_string());
        if let Some(existing) = state.objects.get(&key) {
            updated.meta_mut().uid = existing.meta().uid.clone();
        }
        if status_only {
            state.counts.status_writes += 1;
        } else {
            state.counts.replaces += 1;
        }
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl<K: StoreObject> ObjectApi<K> for MemoryApi<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.stored(namespace, name)
            .ok_or_else(|| Error::not_found(kind::<K>(), name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none() || ns.as_deref() == namespace)
            .filter(|(_, obj)| label_selector.map_or(true, |sel| matches_selector(*obj, sel)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        let key = key_of(obj);
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(kind::<K>(), obj.name_any()));
        }
        state.version += 1;
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(state.version.to_string());
        state.counts.creates += 1;
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.write(obj, false)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        self.write(obj, true)
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<DeletePreconditions>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let key = (namespace.map(str::to_string), name.to_string());
        let existing = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found(kind::<K>(), name))?;
        if let Some(pre) = preconditions {
            let uid_mismatch = pre.uid.is_some() && pre.uid != existing.meta().uid;
            let version_mismatch = pre.resource_version.is_some()
                && pre.resource_version != existing.meta().resource_version;
            if uid_mismatch || version_mismatch {
                state.counts.conflicts += 1;
                return Err(Error::conflict(kind::<K>(), name));
            }
        }
        state.objects.remove(&key);
        state.counts.deletes += 1;
        Ok(())
    }
}

/// Event publisher that records every event it receives
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<(ObjectReference, PendingEvent)>>,
}

impl RecordingEventPublisher {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, in publication order
    pub fn events(&self) -> Vec<PendingEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Recorded reasons, in publication order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, e)| e.reason.clone()).collect()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push((
            resource_ref.clone(),
            PendingEvent::new(severity, reason, note.unwrap_or_default()),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_stale_writes_are_rejected() {
        let api = MemoryApi::<Pod>::new();
        let stale = api.create(&pod("p", &[])).await.expect("create");
        api.mutate(Some("default"), "p", |_| {}).expect("exists");

        let err = api.replace(&stale).await.expect_err("stale");
        assert!(err.is_conflict());
        assert_eq!(api.counts().conflicts, 1);
        assert_eq!(api.counts().replaces, 0);
    }

    #[tokio::test]
    async fn story_delete_preconditions_guard_newer_versions() {
        let api = MemoryApi::<Pod>::new();
        let created = api.create(&pod("p", &[])).await.expect("create");
        let pinned = DeletePreconditions::pinned(&created);
        api.mutate(Some("default"), "p", |_| {}).expect("exists");

        let err = api
            .delete(Some("default"), "p", Some(pinned))
            .await
            .expect_err("precondition fails");
        assert!(err.is_conflict());
        assert!(api.stored(Some("default"), "p").is_some());
    }

    #[tokio::test]
    async fn story_uid_only_preconditions_allow_newer_versions() {
        let api = MemoryApi::<Pod>::new();
        let created = api.create(&pod("p", &[])).await.expect("create");
        let same = DeletePreconditions::same_object(&created);
        api.mutate(Some("default"), "p", |_| {}).expect("exists");
        api.delete(Some("default"), "p", Some(same.clone()))
            .await
            .expect("newer version deleted");

        // A replacement under the same name is a different object.
        api.create(&pod("p", &[])).await.expect("recreate");
        let err = api
            .delete(Some("default"), "p", Some(same))
            .await
            .expect_err("different uid");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_label_selector_filters() {
        let api = MemoryApi::<Pod>::new();
        api.insert(pod("a", &[("app", "x"), ("tier", "web")]));
        api.insert(pod("b", &[("app", "y")]));

        let hits = api
            .list(Some("default"), Some("app=x,tier=web"))
            .await
            .expect("list");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name_any(), "a");
        assert_eq!(api.list(None, None).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        let api = MemoryApi::<Pod>::new();
        api.create(&pod("p", &[])).await.expect("create");
        let err = api.create(&pod("p", &[])).await.expect_err("duplicate");
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(api.counts().creates, 1);
    }
}
