//! Custom Resource Definition for the AWS EFS operator
//!
//! This module defines the `SharedVolume` CRD: a request to mount an EFS
//! access point into a namespace. The operator answers it with a
//! PersistentVolume/PersistentVolumeClaim pair.

use crate::store::NamespacedName;
use kube::{CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Finalizer guarding cleanup of the dependent volume and claim
pub const FINALIZER_NAME: &str = "finalizer.awsefs.managed.openshift.io";

/// Kind written into `status.claimRef`
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

/// Regex for EFS file system IDs (e.g. `fs-0123cdef`)
static FILE_SYSTEM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^fs-[0-9a-f]+$").expect("valid file system id regex"));

/// Regex for EFS access point IDs (e.g. `fsap-0123456789abcdef`)
static ACCESS_POINT_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^fsap-[0-9a-f]+$").expect("valid access point id regex"));

fn validate_file_system_id(value: &str) -> Result<(), ValidationError> {
    if FILE_SYSTEM_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_file_system_id")
            .with_message(format!("'{}' is not a valid EFS file system ID", value).into()))
    }
}

fn validate_access_point_id(value: &str) -> Result<(), ValidationError> {
    if ACCESS_POINT_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_access_point_id")
            .with_message(format!("'{}' is not a valid EFS access point ID", value).into()))
    }
}

/// SharedVolume custom resource definition
///
/// Both spec fields are immutable once the backing PersistentVolume exists.
/// Edits made afterwards are reverted to the values encoded in the volume.
///
/// ```yaml
/// apiVersion: aws-efs.managed.openshift.io/v1alpha1
/// kind: SharedVolume
/// metadata:
///   name: my-shared-volume
///   namespace: my-project
/// spec:
///   fileSystemID: fs-0123cdef
///   accessPointID: fsap-0123456789abcdef
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "aws-efs.managed.openshift.io",
    version = "v1alpha1",
    kind = "SharedVolume",
    plural = "sharedvolumes",
    shortname = "sv",
    namespaced,
    status = "SharedVolumeStatus",
    derive = "Default",
    printcolumn = r#"{"name":"File System", "type":"string", "jsonPath":".spec.fileSystemID"}"#,
    printcolumn = r#"{"name":"Access Point", "type":"string", "jsonPath":".spec.accessPointID"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Claim", "type":"string", "jsonPath":".status.claimRef.name"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#
)]
pub struct SharedVolumeSpec {
    /// The ID of the EFS volume, e.g. `fs-0123cdef`. Required. Immutable.
    #[serde(rename = "fileSystemID")]
    #[schemars(regex(pattern = r"^fs-[0-9a-f]+$"))]
    #[validate(custom(function = "validate_file_system_id"))]
    pub file_system_id: String,

    /// The ID of an EFS access point, e.g. `fsap-0123456789abcdef`. The
    /// volume is mounted at this access point. Required. Immutable.
    #[serde(rename = "accessPointID")]
    #[schemars(regex(pattern = r"^fsap-[0-9a-f]+$"))]
    #[validate(custom(function = "validate_access_point_id"))]
    pub access_point_id: String,
}

/// Lifecycle phase of a SharedVolume
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SharedVolumePhase {
    /// Noticed; the volume and claim are being created
    Pending,
    /// Volume and claim exist as far as the operator can tell. This does not
    /// imply the claim is bound.
    Ready,
    /// Deletion requested; the volume and claim are being removed
    Deleting,
    /// Something went wrong, see `message`
    Failed,
}

impl fmt::Display for SharedVolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SharedVolumePhase::Pending => "Pending",
            SharedVolumePhase::Ready => "Ready",
            SharedVolumePhase::Deleting => "Deleting",
            SharedVolumePhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Typed reference to the claim created for a SharedVolume
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    /// Always `PersistentVolumeClaim`
    #[serde(default)]
    pub kind: String,

    /// Name of the claim in the SharedVolume's namespace
    #[serde(default)]
    pub name: String,

    /// API group of the claim; empty for the core group
    #[serde(default)]
    pub api_group: Option<String>,
}

/// Status of the SharedVolume resource
///
/// Every field is serialized, including empty ones, so that a merge patch
/// of the status clears values left behind by an earlier phase.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharedVolumeStatus {
    /// The claim bound to the volume created for this SharedVolume
    #[serde(default)]
    pub claim_ref: Option<ClaimReference>,

    /// Current phase; unset until the operator first notices the resource
    #[serde(default)]
    pub phase: Option<SharedVolumePhase>,

    /// Human-readable detail, usually what went wrong in the Failed phase
    #[serde(default)]
    pub message: String,
}

impl SharedVolume {
    /// Identity of this SharedVolume
    pub fn owner_key(&self) -> NamespacedName {
        NamespacedName::of(self)
    }

    /// Current phase, if one was ever recorded
    pub fn phase(&self) -> Option<SharedVolumePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Whether our finalizer is registered
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER_NAME)
    }

    /// Whether the platform has requested deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Collect spec validation failures into a single message, or `None` if valid.
    pub fn spec_errors(&self) -> Option<String> {
        let errors = self.spec.validate().err()?;
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(msg) => format!("{}: {}", field, msg),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();
        messages.sort();
        Some(messages.join("; "))
    }
}
