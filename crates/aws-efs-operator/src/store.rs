//! Object store access
//!
//! The reconciler never talks to `kube::Api` directly. It goes through the
//! [`ObjectStore`] and [`StatusStore`] traits so that tests can swap in a
//! mock or an in-memory store, while production uses [`KubeStore`].

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{OperatorError, Result};

/// Identity of an object: a name, plus a namespace for namespaced kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl NamespacedName {
    /// Identity of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Identity of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Identity of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Typed CRUD access to one kind of object.
///
/// Absence is expressed as `Ok(None)` from `get` and as a `NotFound` error
/// from `delete`. Writes return the object as stored, including the new
/// resource version.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K: Send + Sync + 'static>: Send + Sync {
    /// Fetch an object by identity
    async fn get(&self, key: &NamespacedName) -> Result<Option<K>>;

    /// Create an object. Its resource version must be unset.
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object. Its resource version must match the stored one.
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Delete an object by identity
    async fn delete(&self, key: &NamespacedName) -> Result<()>;
}

/// Write access to the status sub-document of one kind of object.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore<K: Send + Sync + 'static>: Send + Sync {
    /// Replace the status of an object, guarded by its resource version
    async fn replace_status(&self, obj: &K) -> Result<K>;
}

type ApiFactory<K> = fn(Client, Option<&str>) -> Api<K>;

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::default_namespaced(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = ClusterResourceScope>,
    K::DynamicType: Default,
{
    Api::all(client)
}

/// [`ObjectStore`] and [`StatusStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    api: ApiFactory<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    /// Store for a namespaced kind
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api: namespaced_api::<K>,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope>,
    K::DynamicType: Default,
{
    /// Store for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api: cluster_api::<K>,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    fn api_for(&self, namespace: Option<&str>) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }

    fn error(err: kube::Error, key: &NamespacedName) -> OperatorError {
        OperatorError::from_kube(err, &K::kind(&()), &key.name, key.namespace.as_deref())
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &NamespacedName) -> Result<Option<K>> {
        self.api_for(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|e| Self::error(e, key))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = NamespacedName::of(obj);
        debug!(kind = %K::kind(&()), resource = %key, "Creating object");
        self.api_for(key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Self::error(e, &key))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = NamespacedName::of(obj);
        debug!(kind = %K::kind(&()), resource = %key, "Replacing object");
        self.api_for(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| Self::error(e, &key))
    }

    async fn delete(&self, key: &NamespacedName) -> Result<()> {
        debug!(kind = %K::kind(&()), resource = %key, "Deleting object");
        self.api_for(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Self::error(e, key))
    }
}

#[async_trait]
impl<K> StatusStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = NamespacedName::of(obj);
        let value = serde_json::to_value(obj)?;

        debug!(kind = %K::kind(&()), resource = %key, "Updating status");

        // The resource version in the patch makes the API server reject it
        // if the object changed since we read it.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or_default(),
        });

        self.api_for(key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Self::error(e, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SharedVolume;
    use k8s_openapi::api::core::v1::PersistentVolume;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_namespaced_name_display() {
        assert_eq!(NamespacedName::namespaced("x", "a").to_string(), "x/a");
        assert_eq!(NamespacedName::cluster("pv-x-a").to_string(), "pv-x-a");
    }

    #[test]
    fn test_namespaced_name_of_object() {
        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-x-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(NamespacedName::of(&pv), NamespacedName::cluster("pv-x-a"));

        let mut sv = SharedVolume::new("a", Default::default());
        sv.metadata.namespace = Some("x".to_string());
        assert_eq!(NamespacedName::of(&sv), NamespacedName::namespaced("x", "a"));
    }

    #[test]
    fn test_same_name_different_namespace_are_distinct() {
        let a = NamespacedName::namespaced("x", "a");
        let b = NamespacedName::namespaced("y", "a");
        assert_ne!(a, b);
        assert_ne!(a, NamespacedName::cluster("a"));
    }
}
