//! Generic create-or-update convergence for one managed object
//!
//! An [`Ensurable`] pairs an object identity with its canonical definition
//! and makes the live object match it. It never retries on its own; every
//! store error goes back to the caller.

use std::fmt::Debug;

use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::ownership::is_managed;
use crate::store::{NamespacedName, ObjectStore};

/// Kinds an [`Ensurable`] can manage
pub trait Managed:
    Resource<DynamicType = ()>
    + Clone
    + Default
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Default
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// How a desired object is compared against the live one.
///
/// Comparisons run on the JSON form of both objects, so fields the server
/// adds outside the compared region never cause a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equality {
    /// The object never needs rewriting once it exists
    Always,
    /// Everything except `metadata` must match
    IgnoringMetadata,
    /// Only the named top-level field must match
    Field(&'static str),
}

impl Equality {
    /// Whether `server` already satisfies `local` under this strategy
    pub fn matches<K: Serialize>(&self, local: &K, server: &K) -> bool {
        match self {
            Equality::Always => true,
            Equality::IgnoringMetadata => {
                match (serde_json::to_value(local), serde_json::to_value(server)) {
                    (Ok(mut l), Ok(mut s)) => {
                        strip(&mut l, "metadata");
                        strip(&mut s, "metadata");
                        l == s
                    }
                    _ => false,
                }
            }
            Equality::Field(field) => {
                match (serde_json::to_value(local), serde_json::to_value(server)) {
                    (Ok(l), Ok(s)) => l.get(field) == s.get(field),
                    _ => false,
                }
            }
        }
    }
}

fn strip(value: &mut Value, field: &str) {
    if let Some(map) = value.as_object_mut() {
        map.remove(field);
    }
}

/// Whether both objects carry the same non-empty resource version
pub fn versions_equal<K: Resource>(local: &K, server: &K) -> bool {
    match (
        local.meta().resource_version.as_deref(),
        server.meta().resource_version.as_deref(),
    ) {
        (Some(l), Some(s)) => !l.is_empty() && l == s,
        _ => false,
    }
}

/// Convergence unit for a single managed object
pub struct Ensurable<K> {
    key: NamespacedName,
    definition: K,
    equality: Equality,
    /// Object as last created, updated or observed converged
    latest: Mutex<Option<K>>,
}

impl<K: Managed> Ensurable<K> {
    pub fn new(key: NamespacedName, definition: K, equality: Equality) -> Self {
        Self {
            key,
            definition,
            equality,
            latest: Mutex::new(None),
        }
    }

    /// Identity of the managed object
    pub fn key(&self) -> &NamespacedName {
        &self.key
    }

    /// Canonical definition of the managed object
    pub fn definition(&self) -> &K {
        &self.definition
    }

    /// A fresh, empty instance of the managed kind
    pub fn empty_instance(&self) -> K {
        K::default()
    }

    /// The object as last written or observed converged, if any
    pub fn last_applied(&self) -> Option<K> {
        self.latest.lock().clone()
    }

    /// Make the live object match the definition.
    ///
    /// Creates the object if it is missing, replaces it if it differs, and
    /// issues no write when it already matches.
    #[instrument(skip(self, store), fields(kind = %K::kind(&()), resource = %self.key))]
    pub async fn ensure(&self, store: &dyn ObjectStore<K>) -> Result<()> {
        let server = store.get(&self.key).await.map_err(|e| {
            error!(error = %e, "Failed to fetch object");
            e
        })?;

        let mut desired = self.latest_definition();

        let Some(server) = server else {
            // Create rejects objects that already carry a version
            desired.meta_mut().resource_version = None;
            let created = store.create(&desired).await.map_err(|e| {
                error!(error = %e, "Failed to create object");
                e
            })?;
            info!("Created object");
            *self.latest.lock() = Some(created);
            return Ok(());
        };

        if self.equal(&desired, &server) {
            debug!("Object already converged");
            *self.latest.lock() = Some(server);
            return Ok(());
        }

        desired.meta_mut().resource_version = server.meta().resource_version.clone();
        let updated = store.replace(&desired).await.map_err(|e| {
            error!(error = %e, "Failed to update object");
            e
        })?;
        info!("Updated object");
        *self.latest.lock() = Some(updated);
        Ok(())
    }

    /// Delete the live object. A missing object counts as deleted.
    #[instrument(skip(self, store), fields(kind = %K::kind(&()), resource = %self.key))]
    pub async fn delete(&self, store: &dyn ObjectStore<K>) -> Result<()> {
        match store.get(&self.key).await {
            Ok(None) => {
                debug!("Object already gone");
                *self.latest.lock() = None;
                return Ok(());
            }
            Ok(Some(_)) => {}
            Err(e) => {
                error!(error = %e, "Failed to fetch object for deletion");
                return Err(e);
            }
        }

        match store.delete(&self.key).await {
            Ok(()) => info!("Deleted object"),
            Err(e) if e.is_not_found() => debug!("Object deleted concurrently"),
            Err(e) => {
                error!(error = %e, "Failed to delete object");
                return Err(e);
            }
        }
        *self.latest.lock() = None;
        Ok(())
    }

    /// Last applied object if known, else the canonical definition, with
    /// the definition's labels stamped back on.
    fn latest_definition(&self) -> K {
        let mut desired = self
            .latest
            .lock()
            .clone()
            .unwrap_or_else(|| self.definition.clone());
        let labels = desired.labels_mut();
        for (key, value) in self.definition.labels() {
            labels.insert(key.clone(), value.clone());
        }
        desired
    }

    fn equal(&self, local: &K, server: &K) -> bool {
        if versions_equal(local, server) {
            return true;
        }
        // Someone stripped our marker; rewrite to restore it
        if !is_managed(server) {
            return false;
        }
        self.equality.matches(local, server)
    }
}
