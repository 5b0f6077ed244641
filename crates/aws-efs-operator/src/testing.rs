//! In-memory object store for tests
//!
//! Behaves like the API server where the reconciler can tell the
//! difference: resource versions, optimistic concurrency on update,
//! AlreadyExists on create, finalizer-gated deletion and a separate status
//! sub-document.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;

use crate::ensurable::Managed;
use crate::error::{OperatorError, Result};
use crate::store::{NamespacedName, ObjectStore, StatusStore};

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Get,
    Create,
    Replace,
    Delete,
    ReplaceStatus,
}

/// Writes issued through the store interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriteCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub status_updates: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes + self.status_updates
    }
}

struct State<K> {
    objects: BTreeMap<NamespacedName, K>,
    version: u64,
    writes: WriteCounts,
    failing: HashSet<Op>,
}

pub(crate) struct MemoryStore<K> {
    state: Mutex<State<K>>,
}

impl<K: Managed> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                writes: WriteCounts::default(),
                failing: HashSet::new(),
            }),
        }
    }

    /// Seed an object without counting a write
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.state.lock();
        state.version += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(NamespacedName::of(&obj), obj.clone());
        obj
    }

    /// Current stored copy of an object
    pub fn object(&self, key: &NamespacedName) -> Option<K> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Edit an object out of band, as a user or another controller would
    pub fn mutate(&self, key: &NamespacedName, edit: impl FnOnce(&mut K)) {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version.to_string();
        if let Some(obj) = state.objects.get_mut(key) {
            edit(obj);
            obj.meta_mut().resource_version = Some(version);
        }
    }

    /// Remove an object out of band
    pub fn remove(&self, key: &NamespacedName) -> Option<K> {
        self.state.lock().objects.remove(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn writes(&self) -> WriteCounts {
        self.state.lock().writes
    }

    pub fn reset_writes(&self) {
        self.state.lock().writes = WriteCounts::default();
    }

    pub fn fail(&self, op: Op) {
        self.state.lock().failing.insert(op);
    }

    pub fn heal(&self, op: Op) {
        self.state.lock().failing.remove(&op);
    }

    fn check(state: &State<K>, op: Op) -> Result<()> {
        if state.failing.contains(&op) {
            Err(OperatorError::Internal(format!("injected {:?} failure", op)))
        } else {
            Ok(())
        }
    }

    fn not_found(key: &NamespacedName) -> OperatorError {
        OperatorError::not_found(&K::kind(&()), &key.name, key.namespace.as_deref())
    }

    fn conflict(key: &NamespacedName, reason: &str) -> OperatorError {
        OperatorError::Conflict {
            kind: K::kind(&()).to_string(),
            name: key.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn check_version(stored: &K, obj: &K, key: &NamespacedName) -> Result<()> {
        if obj.meta().resource_version != stored.meta().resource_version {
            return Err(Self::conflict(key, "the object has been modified"));
        }
        Ok(())
    }
}

/// Copy the `status` of `from` onto `onto`.
fn with_status_of<K: Managed>(onto: &K, from: &K) -> Result<K> {
    let mut value = serde_json::to_value(onto)?;
    let status = serde_json::to_value(from)?.get("status").cloned();
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn deletion_time() -> Result<Time> {
    Ok(serde_json::from_value(Value::String(
        "2024-01-01T00:00:00Z".to_string(),
    ))?)
}

#[async_trait]
impl<K: Managed> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, key: &NamespacedName) -> Result<Option<K>> {
        let state = self.state.lock();
        Self::check(&state, Op::Get)?;
        Ok(state.objects.get(key).cloned())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        Self::check(&state, Op::Create)?;
        let key = NamespacedName::of(obj);
        if obj.resource_version().is_some() {
            return Err(OperatorError::Internal(
                "resourceVersion should not be set on objects to be created".to_string(),
            ));
        }
        if state.objects.contains_key(&key) {
            return Err(Self::conflict(&key, "already exists"));
        }

        state.version += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(key, stored.clone());
        state.writes.creates += 1;
        Ok(stored)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        Self::check(&state, Op::Replace)?;
        let key = NamespacedName::of(obj);
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(current, obj, &key)?;

        // Status only changes through the status sub-document
        let mut stored = with_status_of(obj, current)?;
        stored.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        state.writes.updates += 1;

        if stored.meta().deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.objects.remove(&key);
            return Ok(stored);
        }

        state.version += 1;
        stored.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &NamespacedName) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, Op::Delete)?;
        let Some(current) = state.objects.get(key) else {
            return Err(Self::not_found(key));
        };
        let finalized = current.finalizers().is_empty();
        state.writes.deletes += 1;

        if finalized {
            state.objects.remove(key);
            return Ok(());
        }

        let time = deletion_time()?;
        state.version += 1;
        let version = state.version.to_string();
        if let Some(obj) = state.objects.get_mut(key) {
            obj.meta_mut().deletion_timestamp = Some(time);
            obj.meta_mut().resource_version = Some(version);
        }
        Ok(())
    }
}

#[async_trait]
impl<K: Managed> StatusStore<K> for MemoryStore<K> {
    async fn replace_status(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        Self::check(&state, Op::ReplaceStatus)?;
        let key = NamespacedName::of(obj);
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(current, obj, &key)?;

        let mut stored = with_status_of(current, obj)?;
        state.version += 1;
        stored.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(key, stored.clone());
        state.writes.status_updates += 1;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SharedVolume, SharedVolumeStatus, FINALIZER_NAME};

    fn shared_volume() -> SharedVolume {
        let mut sv = SharedVolume::new("a", Default::default());
        sv.metadata.namespace = Some("x".to_string());
        sv
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_versions() {
        let store = MemoryStore::<SharedVolume>::new();
        let created = store.create(&shared_volume()).await.unwrap();
        assert!(created.resource_version().is_some());

        assert!(store.create(&shared_volume()).await.unwrap_err().is_conflict());
        assert!(store.create(&created).await.is_err());
        assert_eq!(store.writes().creates, 1);
    }

    #[tokio::test]
    async fn test_replace_requires_current_version() {
        let store = MemoryStore::<SharedVolume>::new();
        let stale = store.insert(shared_volume());
        store.mutate(&stale.owner_key(), |sv| sv.spec.file_system_id = "fs-1".into());

        assert!(store.replace(&stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_replace_keeps_status_and_status_keeps_spec() {
        let store = MemoryStore::<SharedVolume>::new();
        let mut sv = store.insert(shared_volume());

        sv.status = Some(SharedVolumeStatus {
            message: "hello".to_string(),
            ..Default::default()
        });
        sv.spec.file_system_id = "fs-ignored".to_string();
        let sv = store.replace_status(&sv).await.unwrap();
        let stored = store.object(&sv.owner_key()).unwrap();
        assert_eq!(stored.status.unwrap().message, "hello");
        assert_eq!(stored.spec.file_system_id, "");

        let mut edited = stored_without_status(&store, &sv);
        edited.spec.file_system_id = "fs-2".to_string();
        store.replace(&edited).await.unwrap();
        let stored = store.object(&sv.owner_key()).unwrap();
        assert_eq!(stored.spec.file_system_id, "fs-2");
        assert_eq!(stored.status.unwrap().message, "hello");
    }

    fn stored_without_status(store: &MemoryStore<SharedVolume>, sv: &SharedVolume) -> SharedVolume {
        let mut obj = store.object(&sv.owner_key()).unwrap();
        obj.status = None;
        obj
    }

    #[tokio::test]
    async fn test_finalizer_gates_deletion() {
        let store = MemoryStore::<SharedVolume>::new();
        let mut sv = shared_volume();
        sv.finalizers_mut().push(FINALIZER_NAME.to_string());
        let sv = store.insert(sv);
        let key = sv.owner_key();

        store.delete(&key).await.unwrap();
        let mut pending = store.object(&key).unwrap();
        assert!(pending.is_deleting());

        pending.finalizers_mut().clear();
        store.replace(&pending).await.unwrap();
        assert!(store.object(&key).is_none());
        assert!(store.delete(&key).await.unwrap_err().is_not_found());
    }
}
