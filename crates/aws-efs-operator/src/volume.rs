//! PersistentVolume and PersistentVolumeClaim definitions for a SharedVolume
//!
//! Names are derived from the owner so identities can be recomputed without
//! a lookup. The volume encodes the EFS identifiers in its CSI volume handle
//! as `fs-id::fsap-id`; [`AccessPointIds::from_volume`] reads them back.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use crate::crd::SharedVolume;
use crate::ensurable::{Ensurable, Equality};
use crate::error::{OperatorError, Result};
use crate::ownership::{link_owner, mark_managed};
use crate::store::NamespacedName;

/// Default CSI driver backing the volumes
pub const DEFAULT_CSI_DRIVER: &str = "efs.csi.aws.com";

/// Default storage class of volumes and claims
pub const DEFAULT_STORAGE_CLASS: &str = "efs-sc";

/// Nominal size; EFS ignores it but the schema requires one
const NOMINAL_CAPACITY: &str = "1Gi";

/// Mount option naming the access point in the legacy handle encoding
const ACCESS_POINT_MOUNT_OPTION: &str = "accesspoint";

/// Settings applied to every generated volume and claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    /// CSI driver written into volumes
    pub csi_driver: String,
    /// Storage class of volumes and claims
    pub storage_class: String,
}

impl VolumeConfig {
    /// Build a config, rejecting blank names.
    pub fn new(csi_driver: impl Into<String>, storage_class: impl Into<String>) -> Result<Self> {
        let config = Self {
            csi_driver: csi_driver.into(),
            storage_class: storage_class.into(),
        };
        if config.csi_driver.trim().is_empty() {
            return Err(OperatorError::InvalidConfig(
                "CSI driver name must not be empty".to_string(),
            ));
        }
        if config.storage_class.trim().is_empty() {
            return Err(OperatorError::InvalidConfig(
                "storage class name must not be empty".to_string(),
            ));
        }
        Ok(config)
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            csi_driver: DEFAULT_CSI_DRIVER.to_string(),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }
}

/// Name of the PersistentVolume for an owner.
///
/// Volumes are cluster-scoped, so the owner namespace is part of the name.
pub fn volume_name(owner: &NamespacedName) -> String {
    format!(
        "pv-{}-{}",
        owner.namespace.as_deref().unwrap_or_default(),
        owner.name
    )
}

/// Identity of the PersistentVolume for an owner
pub fn volume_key(owner: &NamespacedName) -> NamespacedName {
    NamespacedName::cluster(volume_name(owner))
}

/// Identity of the PersistentVolumeClaim for an owner
pub fn claim_key(owner: &NamespacedName) -> NamespacedName {
    NamespacedName {
        namespace: owner.namespace.clone(),
        name: format!("pvc-{}", owner.name),
    }
}

fn nominal_capacity() -> BTreeMap<String, Quantity> {
    BTreeMap::from([(
        "storage".to_string(),
        Quantity(NOMINAL_CAPACITY.to_string()),
    )])
}

/// Canonical PersistentVolume for a SharedVolume
pub fn volume_definition(sv: &SharedVolume, config: &VolumeConfig) -> PersistentVolume {
    let owner = sv.owner_key();
    let mut pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume_name(&owner)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(nominal_capacity()),
            volume_mode: Some("Filesystem".to_string()),
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(config.storage_class.clone()),
            csi: Some(CSIPersistentVolumeSource {
                driver: config.csi_driver.clone(),
                volume_handle: format!(
                    "{}::{}",
                    sv.spec.file_system_id, sv.spec.access_point_id
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    };
    link_owner(&mut pv, &owner);
    mark_managed(&mut pv);
    pv
}

/// Canonical PersistentVolumeClaim for a SharedVolume
pub fn claim_definition(sv: &SharedVolume, config: &VolumeConfig) -> PersistentVolumeClaim {
    let owner = sv.owner_key();
    let key = claim_key(&owner);
    let mut pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(key.name),
            namespace: key.namespace,
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(nominal_capacity()),
                ..Default::default()
            }),
            storage_class_name: Some(config.storage_class.clone()),
            volume_mode: Some("Filesystem".to_string()),
            volume_name: Some(volume_name(&owner)),
            ..Default::default()
        }),
        status: None,
    };
    link_owner(&mut pvc, &owner);
    mark_managed(&mut pvc);
    pvc
}

/// Ensurable for the volume of a SharedVolume.
///
/// A bound volume cannot be meaningfully updated, so it is never rewritten.
pub fn volume_ensurable(sv: &SharedVolume, config: &VolumeConfig) -> Ensurable<PersistentVolume> {
    Ensurable::new(
        volume_key(&sv.owner_key()),
        volume_definition(sv, config),
        Equality::Always,
    )
}

/// Ensurable for the claim of a SharedVolume.
pub fn claim_ensurable(
    sv: &SharedVolume,
    config: &VolumeConfig,
) -> Ensurable<PersistentVolumeClaim> {
    Ensurable::new(
        claim_key(&sv.owner_key()),
        claim_definition(sv, config),
        Equality::Field("spec"),
    )
}

/// Ways a volume can fail to yield its EFS identifiers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedVolume {
    #[error("volume has no CSI source")]
    MissingCsiSource,

    #[error("volume handle is empty")]
    EmptyHandle,

    #[error("cannot parse volume handle '{0}'")]
    UnparseableHandle(String),

    #[error("volume handle has no file system ID")]
    MissingFileSystem,

    #[error("volume has no access point ID")]
    MissingAccessPoint,
}

/// EFS identifiers encoded in a PersistentVolume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointIds {
    pub file_system_id: String,
    pub access_point_id: String,
}

impl AccessPointIds {
    /// Decode the identifiers from a volume's CSI handle.
    ///
    /// Accepts `fs-id::fsap-id`, and the legacy form where the handle holds
    /// only `fs-id` and the access point comes from an `accesspoint=fsap-id`
    /// mount option. When that option is repeated, the last one wins.
    pub fn from_volume(pv: &PersistentVolume) -> std::result::Result<Self, MalformedVolume> {
        let spec = pv.spec.as_ref().ok_or(MalformedVolume::MissingCsiSource)?;
        let csi = spec.csi.as_ref().ok_or(MalformedVolume::MissingCsiSource)?;
        let handle = csi.volume_handle.as_str();
        if handle.is_empty() {
            return Err(MalformedVolume::EmptyHandle);
        }

        let tokens: Vec<&str> = handle.splitn(3, ':').collect();
        let (file_system_id, access_point_id) = match tokens.as_slice() {
            [fs] => {
                let ap = spec
                    .mount_options
                    .iter()
                    .flatten()
                    .filter_map(|opt| opt.split_once('='))
                    .filter(|(key, _)| *key == ACCESS_POINT_MOUNT_OPTION)
                    .map(|(_, value)| value)
                    .last()
                    .unwrap_or_default();
                (*fs, ap)
            }
            [fs, _subpath, ap] => (*fs, *ap),
            _ => return Err(MalformedVolume::UnparseableHandle(handle.to_string())),
        };

        if file_system_id.is_empty() {
            return Err(MalformedVolume::MissingFileSystem);
        }
        if access_point_id.is_empty() {
            return Err(MalformedVolume::MissingAccessPoint);
        }

        Ok(Self {
            file_system_id: file_system_id.to_string(),
            access_point_id: access_point_id.to_string(),
        })
    }
}
