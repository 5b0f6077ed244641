//! Label-based ownership linkage
//!
//! A PersistentVolume is cluster-scoped, so it cannot carry an owner
//! reference to a namespaced SharedVolume. Instead every dependent object is
//! stamped with two labels naming its owner, and change events on dependents
//! are routed back to the owner through those labels. Claims use the same
//! mechanism so both dependent kinds behave alike.

use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::warn;

use crate::crd::SharedVolume;
use crate::store::NamespacedName;

/// Label holding the namespace of the owning SharedVolume
pub const OWNER_NAMESPACE_LABEL: &str = "openshift.io/aws-efs-operator-shared-volume-owner-namespace";

/// Label holding the name of the owning SharedVolume
pub const OWNER_NAME_LABEL: &str = "openshift.io/aws-efs-operator-shared-volume-owner-name";

/// Label marking objects written by this operator
pub const MANAGED_BY_LABEL: &str = "openshift.io/aws-efs-operator-owned";

/// Value of [`MANAGED_BY_LABEL`] on our objects
pub const MANAGED_BY_VALUE: &str = "true";

/// Label selector matching every object this operator manages
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Stamp the managed-by marker onto an object.
pub fn mark_managed<K: Resource>(obj: &mut K) {
    obj.labels_mut()
        .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
}

/// Whether an object still carries the managed-by marker.
pub fn is_managed<K: Resource>(obj: &K) -> bool {
    obj.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
}

/// Point a dependent object at its owning SharedVolume.
pub fn link_owner<K: Resource>(obj: &mut K, owner: &NamespacedName) {
    let labels = obj.labels_mut();
    labels.insert(
        OWNER_NAMESPACE_LABEL.to_string(),
        owner.namespace.clone().unwrap_or_default(),
    );
    labels.insert(OWNER_NAME_LABEL.to_string(), owner.name.clone());
}

/// Recover the owning SharedVolume of a dependent object.
///
/// Returns `None` unless both labels are present and non-empty.
pub fn owner_of<K: Resource>(obj: &K) -> Option<NamespacedName> {
    let labels = obj.labels();
    let namespace = labels.get(OWNER_NAMESPACE_LABEL).filter(|v| !v.is_empty())?;
    let name = labels.get(OWNER_NAME_LABEL).filter(|v| !v.is_empty())?;
    Some(NamespacedName::namespaced(namespace.as_str(), name.as_str()))
}

/// Map a change on a dependent object to a reconcile request for its owner.
///
/// Objects whose owner labels are missing are logged and dropped.
pub fn shared_volume_for<K>(obj: &K) -> Option<ObjectRef<SharedVolume>>
where
    K: Resource<DynamicType = ()>,
{
    match owner_of(obj) {
        Some(owner) => {
            let reference = ObjectRef::new(&owner.name);
            Some(match owner.namespace {
                Some(ns) => reference.within(&ns),
                None => reference,
            })
        }
        None => {
            warn!(
                kind = %K::kind(&()),
                name = %obj.name_any(),
                "Managed object is missing its owner labels, ignoring event"
            );
            None
        }
    }
}
