//! # AWS EFS Operator
//!
//! Kubernetes operator that exposes EFS access points to namespaces through
//! `SharedVolume` custom resources.
//!
//! For every SharedVolume the operator maintains a cluster-scoped
//! PersistentVolume backed by the EFS CSI driver, and a PersistentVolumeClaim
//! bound to it in the SharedVolume's namespace. Pods mount the claim.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use aws_efs_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, VolumeConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: SharedVolumes, plus volumes and claims carrying the
//!    operator's ownership marker label
//! 2. **Route**: events on volumes and claims are mapped back to their owning
//!    SharedVolume through owner labels (a cluster-scoped volume cannot hold
//!    an owner reference to a namespaced object)
//! 3. **Reconcile**: one state-changing step per pass: revert spec edits,
//!    register the finalizer, initialise status, then converge the volume
//!    and the claim
//! 4. **Status**: phase `Pending`, `Ready`, `Failed` or `Deleting`, with a
//!    reference to the claim once ready
//!
//! The spec of a SharedVolume is immutable once its volume exists. Edits are
//! reverted to the identifiers encoded in the volume's CSI handle.
//!
//! ## Modules
//!
//! - [`crd`] - SharedVolume resource types with validation
//! - [`controller`] - SharedVolume reconciliation and controller setup
//! - [`ensurable`] - Generic create-or-update convergence for one object
//! - [`volume`] - Volume and claim definitions, CSI handle decoding
//! - [`ownership`] - Owner labels and event routing
//! - [`cache`] - Per-owner Ensurable cache
//! - [`store`] - Object store seam over the Kubernetes API
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: aws-efs.managed.openshift.io/v1alpha1
//! kind: SharedVolume
//! metadata:
//!   name: my-shared-volume
//!   namespace: my-project
//! spec:
//!   fileSystemID: fs-0123cdef
//!   accessPointID: fsap-0123456789abcdef
//! ```
//!
//! ## Metrics
//!
//! - `aws_efs_operator_reconciliations_total` - Total reconciliation attempts
//! - `aws_efs_operator_reconciliation_errors_total` - Reconciliation errors
//! - `aws_efs_operator_requeues_total` - Passes that asked to run again
//! - `aws_efs_operator_reconciliation_duration_seconds` - Reconciliation latency

pub mod cache;
pub mod controller;
pub mod crd;
pub mod ensurable;
pub mod error;
pub mod ownership;
pub mod store;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::cache::EnsurableCache;
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, Outcome, SharedVolumeReconciler,
        Stores,
    };
    pub use crate::crd::{
        ClaimReference, SharedVolume, SharedVolumePhase, SharedVolumeSpec, SharedVolumeStatus,
    };
    pub use crate::ensurable::{Ensurable, Equality};
    pub use crate::error::{OperatorError, Result};
    pub use crate::store::{KubeStore, NamespacedName, ObjectStore, StatusStore};
    pub use crate::volume::{AccessPointIds, MalformedVolume, VolumeConfig};
}
