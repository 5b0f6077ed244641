//! Per-owner cache of Ensurables
//!
//! Entries are keyed by the owning SharedVolume, not by the generated object
//! identity, so same-named SharedVolumes in different namespaces never
//! share an entry. Reconciles for different keys run concurrently, hence the
//! sharded maps.

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};

use crate::crd::SharedVolume;
use crate::ensurable::Ensurable;
use crate::store::NamespacedName;
use crate::volume::{claim_ensurable, volume_ensurable, VolumeConfig};

/// Ensurables for the volume and claim of every known SharedVolume
#[derive(Default)]
pub struct EnsurableCache {
    volumes: DashMap<NamespacedName, Arc<Ensurable<PersistentVolume>>>,
    claims: DashMap<NamespacedName, Arc<Ensurable<PersistentVolumeClaim>>>,
}

impl EnsurableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Volume Ensurable for a SharedVolume, built on first use
    pub fn volume(&self, sv: &SharedVolume, config: &VolumeConfig) -> Arc<Ensurable<PersistentVolume>> {
        self.volumes
            .entry(sv.owner_key())
            .or_insert_with(|| Arc::new(volume_ensurable(sv, config)))
            .clone()
    }

    /// Claim Ensurable for a SharedVolume, built on first use
    pub fn claim(
        &self,
        sv: &SharedVolume,
        config: &VolumeConfig,
    ) -> Arc<Ensurable<PersistentVolumeClaim>> {
        self.claims
            .entry(sv.owner_key())
            .or_insert_with(|| Arc::new(claim_ensurable(sv, config)))
            .clone()
    }

    /// Drop both entries of an owner
    pub fn evict(&self, owner: &NamespacedName) {
        self.volumes.remove(owner);
        self.claims.remove(owner);
    }

    /// Number of owners with at least one cached entry
    pub fn len(&self) -> usize {
        let extra_claims = self
            .claims
            .iter()
            .filter(|entry| !self.volumes.contains_key(entry.key()))
            .count();
        self.volumes.len() + extra_claims
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty() && self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SharedVolumeSpec;
    use crate::volume::AccessPointIds;

    fn shared_volume(ns: &str, name: &str, fs: &str, ap: &str) -> SharedVolume {
        let mut sv = SharedVolume::new(
            name,
            SharedVolumeSpec {
                file_system_id: fs.to_string(),
                access_point_id: ap.to_string(),
            },
        );
        sv.metadata.namespace = Some(ns.to_string());
        sv
    }

    #[test]
    fn test_entries_are_reused() {
        let cache = EnsurableCache::new();
        let config = VolumeConfig::default();
        let sv = shared_volume("x", "a", "fs-1", "fsap-1");

        let first = cache.volume(&sv, &config);
        let second = cache.volume(&sv, &config);
        assert!(Arc::ptr_eq(&first, &second));

        let first = cache.claim(&sv, &config);
        let second = cache.claim(&sv, &config);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let cache = EnsurableCache::new();
        let config = VolumeConfig::default();
        let in_x = shared_volume("x", "a", "fs-1", "fsap-1");
        let in_y = shared_volume("y", "a", "fs-2", "fsap-2");

        let pv_x = cache.volume(&in_x, &config);
        let pv_y = cache.volume(&in_y, &config);
        assert!(!Arc::ptr_eq(&pv_x, &pv_y));
        assert_ne!(pv_x.key(), pv_y.key());

        let ids_x = AccessPointIds::from_volume(pv_x.definition()).unwrap();
        let ids_y = AccessPointIds::from_volume(pv_y.definition()).unwrap();
        assert_eq!(ids_x.file_system_id, "fs-1");
        assert_eq!(ids_y.file_system_id, "fs-2");

        let pvc_x = cache.claim(&in_x, &config);
        let pvc_y = cache.claim(&in_y, &config);
        assert_ne!(pvc_x.key(), pvc_y.key());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_evict_drops_both_entries() {
        let cache = EnsurableCache::new();
        let config = VolumeConfig::default();
        let sv = shared_volume("x", "a", "fs-1", "fsap-1");
        let other = shared_volume("y", "b", "fs-2", "fsap-2");

        let old = cache.volume(&sv, &config);
        cache.claim(&sv, &config);
        cache.volume(&other, &config);

        cache.evict(&sv.owner_key());
        assert_eq!(cache.len(), 1);

        let fresh = cache.volume(&sv, &config);
        assert!(!Arc::ptr_eq(&old, &fresh));

        cache.evict(&sv.owner_key());
        cache.evict(&other.owner_key());
        assert!(cache.is_empty());
    }
}
