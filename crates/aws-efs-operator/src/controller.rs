//! SharedVolume Controller
//!
//! This module implements the Kubernetes controller pattern for managing
//! SharedVolume custom resources. Each pass performs at most one
//! state-changing step and asks to be requeued whenever it wrote something,
//! so the sequence is safe to re-enter at any point.

use crate::cache::EnsurableCache;
use crate::crd::{
    ClaimReference, SharedVolume, SharedVolumePhase, SharedVolumeStatus, CLAIM_KIND,
    FINALIZER_NAME,
};
use crate::error::{OperatorError, Result};
use crate::ownership::{managed_selector, owner_of, shared_volume_for};
use crate::store::{KubeStore, NamespacedName, ObjectStore, StatusStore};
use crate::volume::{claim_key, volume_key, AccessPointIds, MalformedVolume, VolumeConfig};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// What the caller should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until something changes
    Done,
    /// A write was issued; run again right away
    Requeue,
}

/// Object stores the reconciler reads and writes
#[derive(Clone)]
pub struct Stores {
    pub shared_volumes: Arc<dyn ObjectStore<SharedVolume>>,
    pub statuses: Arc<dyn StatusStore<SharedVolume>>,
    pub volumes: Arc<dyn ObjectStore<PersistentVolume>>,
    pub claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
}

impl Stores {
    /// Stores backed by the API server
    pub fn from_client(client: Client) -> Self {
        let shared_volumes = Arc::new(KubeStore::<SharedVolume>::namespaced(client.clone()));
        Self {
            shared_volumes: shared_volumes.clone(),
            statuses: shared_volumes,
            volumes: Arc::new(KubeStore::<PersistentVolume>::cluster(client.clone())),
            claims: Arc::new(KubeStore::<PersistentVolumeClaim>::namespaced(client)),
        }
    }
}

/// Drives a SharedVolume and its volume and claim towards the desired state
pub struct SharedVolumeReconciler {
    stores: Stores,
    cache: Arc<EnsurableCache>,
    config: VolumeConfig,
}

impl SharedVolumeReconciler {
    pub fn new(stores: Stores, cache: Arc<EnsurableCache>, config: VolumeConfig) -> Self {
        Self {
            stores,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &EnsurableCache {
        &self.cache
    }

    /// Run one reconcile pass for the SharedVolume identified by `key`.
    #[instrument(skip(self, key), fields(name = %key.name, namespace = key.namespace.as_deref()))]
    pub async fn reconcile(&self, key: &NamespacedName) -> Result<Outcome> {
        let fetched = self.stores.shared_volumes.get(key).await.map_err(|e| {
            error!(error = %e, "Failed to fetch SharedVolume");
            e
        })?;

        let Some(mut sv) = fetched else {
            debug!("SharedVolume no longer exists");
            self.cache.evict(key);
            return Ok(Outcome::Done);
        };

        if sv.is_deleting() {
            info!("SharedVolume is being deleted");
            // Deletion proceeds whether or not the status write lands
            let _ = self
                .mark_status(&mut sv, SharedVolumePhase::Deleting, "")
                .await;
            self.finalize(&mut sv).await?;
            return Ok(Outcome::Done);
        }

        if self.unedit(&mut sv).await? {
            return Ok(Outcome::Requeue);
        }

        if self.ensure_finalizer(&mut sv).await? {
            return Ok(Outcome::Requeue);
        }

        if sv.phase().is_none() {
            self.mark_status(&mut sv, SharedVolumePhase::Pending, "")
                .await?;
            return Ok(Outcome::Requeue);
        }

        if let Some(message) = sv.spec_errors() {
            warn!(errors = %message, "SharedVolume spec validation failed");
            self.mark_failed(&mut sv, &message).await;
            return Err(OperatorError::ValidationError(message));
        }

        if let Err(e) = self.converge(&sv).await {
            self.mark_failed(&mut sv, &e.to_string()).await;
            return Err(e);
        }

        let claim = claim_key(&sv.owner_key());
        self.mark_ready(&mut sv, &claim.name).await?;
        Ok(Outcome::Done)
    }

    /// Ensure the volume, then the claim.
    async fn converge(&self, sv: &SharedVolume) -> Result<()> {
        self.cache
            .volume(sv, &self.config)
            .ensure(self.stores.volumes.as_ref())
            .await?;
        self.cache
            .claim(sv, &self.config)
            .ensure(self.stores.claims.as_ref())
            .await
    }

    /// Register the finalizer. Returns whether a write was issued.
    async fn ensure_finalizer(&self, sv: &mut SharedVolume) -> Result<bool> {
        if sv.has_finalizer() {
            return Ok(false);
        }

        let mut updated = sv.clone();
        updated.finalizers_mut().push(FINALIZER_NAME.to_string());
        *sv = self.replace(&updated).await?;

        info!("Added finalizer");
        Ok(true)
    }

    /// Revert edits to the spec so it matches the identifiers baked into the
    /// existing volume. Returns whether the SharedVolume was updated.
    ///
    /// A missing volume means the spec is trusted as is. A volume whose
    /// identifiers cannot be read is left to the convergence step and does
    /// not block the pass. A volume labelled for another SharedVolume is a
    /// name collision: the spec is left alone and the pass fails before
    /// convergence.
    pub async fn unedit(&self, sv: &mut SharedVolume) -> Result<bool> {
        let key = volume_key(&sv.owner_key());
        let pv = match self.stores.volumes.get(&key).await {
            Ok(Some(pv)) => pv,
            Ok(None) => {
                debug!(volume = %key, "Volume does not exist yet, trusting spec");
                return Ok(false);
            }
            Err(e) => {
                error!(volume = %key, error = %e, "Failed to fetch volume");
                return Err(e);
            }
        };

        if let Some(other) = foreign_owner(&pv, sv) {
            let message = format!("volume {} already belongs to SharedVolume {}", key, other);
            error!(volume = %key, owner = %other, "Volume name collides with another SharedVolume");
            self.mark_failed(sv, &message).await;
            return Err(OperatorError::ReconcileFailed(message));
        }

        let ids = match AccessPointIds::from_volume(&pv) {
            Ok(ids) => ids,
            Err(reason @ MalformedVolume::MissingAccessPoint) => {
                warn!(volume = %key, reason = %reason, "Volume has no access point, leaving spec alone");
                return Ok(false);
            }
            Err(reason) => {
                error!(volume = %key, reason = %reason, "Volume is malformed, leaving spec alone");
                return Ok(false);
            }
        };

        let mut updated = sv.clone();
        let mut edited = false;
        if updated.spec.file_system_id != ids.file_system_id {
            info!(
                current = %updated.spec.file_system_id,
                restored = %ids.file_system_id,
                "Reverting fileSystemID edit"
            );
            updated.spec.file_system_id = ids.file_system_id;
            edited = true;
        }
        if updated.spec.access_point_id != ids.access_point_id {
            info!(
                current = %updated.spec.access_point_id,
                restored = %ids.access_point_id,
                "Reverting accessPointID edit"
            );
            updated.spec.access_point_id = ids.access_point_id;
            edited = true;
        }

        if !edited {
            return Ok(false);
        }

        *sv = self.replace(&updated).await?;
        Ok(true)
    }

    /// Delete the claim and then the volume, and release the finalizer.
    ///
    /// Cached Ensurables are evicted even when a deletion fails, so that a
    /// later re-creation starts from fresh definitions.
    pub async fn finalize(&self, sv: &mut SharedVolume) -> Result<()> {
        if !sv.has_finalizer() {
            debug!("Finalizer already removed");
            return Ok(());
        }

        let deleted = self.delete_dependents(sv).await;
        self.cache.evict(&sv.owner_key());
        deleted?;

        let mut updated = sv.clone();
        updated.finalizers_mut().retain(|f| f != FINALIZER_NAME);
        *sv = self
            .replace(&updated)
            .await
            .map_err(|e| OperatorError::FinalizerError(e.to_string()))?;

        info!("Removed finalizer");
        Ok(())
    }

    async fn delete_dependents(&self, sv: &SharedVolume) -> Result<()> {
        self.cache
            .claim(sv, &self.config)
            .delete(self.stores.claims.as_ref())
            .await?;

        let key = volume_key(&sv.owner_key());
        if let Some(pv) = self.stores.volumes.get(&key).await? {
            if let Some(other) = foreign_owner(&pv, sv) {
                warn!(volume = %key, owner = %other, "Volume belongs to another SharedVolume, not deleting it");
                return Ok(());
            }
        }
        self.cache
            .volume(sv, &self.config)
            .delete(self.stores.volumes.as_ref())
            .await
    }

    /// Set phase and message, writing only if either differs.
    pub async fn mark_status(
        &self,
        sv: &mut SharedVolume,
        phase: SharedVolumePhase,
        message: &str,
    ) -> Result<()> {
        let current = sv.status.clone().unwrap_or_default();
        if current.phase == Some(phase) && current.message == message {
            return Ok(());
        }

        let status = SharedVolumeStatus {
            phase: Some(phase),
            message: message.to_string(),
            ..current
        };
        self.write_status(sv, status).await
    }

    /// Mark the SharedVolume Ready with a reference to its claim.
    ///
    /// Ready always carries an empty message, so a leftover failure message
    /// alone is enough to trigger a write.
    pub async fn mark_ready(&self, sv: &mut SharedVolume, claim_name: &str) -> Result<()> {
        let current = sv.status.clone().unwrap_or_default();
        let current_claim = current.claim_ref.as_ref().map(|c| c.name.as_str());
        if current.phase == Some(SharedVolumePhase::Ready)
            && current_claim == Some(claim_name)
            && current.message.is_empty()
        {
            return Ok(());
        }

        let status = SharedVolumeStatus {
            phase: Some(SharedVolumePhase::Ready),
            message: String::new(),
            claim_ref: Some(ClaimReference {
                kind: CLAIM_KIND.to_string(),
                name: claim_name.to_string(),
                api_group: Some(String::new()),
            }),
        };
        self.write_status(sv, status).await
    }

    /// Best-effort Failed marker; the caller's error is what propagates.
    async fn mark_failed(&self, sv: &mut SharedVolume, message: &str) {
        // Already logged by write_status
        let _ = self
            .mark_status(sv, SharedVolumePhase::Failed, message)
            .await;
    }

    async fn write_status(&self, sv: &mut SharedVolume, status: SharedVolumeStatus) -> Result<()> {
        let phase = status.phase;
        let mut updated = sv.clone();
        updated.status = Some(status);

        match self.stores.statuses.replace_status(&updated).await {
            Ok(stored) => {
                debug!(phase = ?phase, "Updated SharedVolume status");
                *sv = stored;
                Ok(())
            }
            Err(e) => {
                error!(phase = ?phase, error = %e, "Failed to update SharedVolume status");
                Err(e)
            }
        }
    }

    async fn replace(&self, sv: &SharedVolume) -> Result<SharedVolume> {
        self.stores.shared_volumes.replace(sv).await.map_err(|e| {
            error!(error = %e, "Failed to update SharedVolume");
            e
        })
    }
}

/// Owner recorded on `pv` when it is some SharedVolume other than `sv`.
///
/// Volume names join namespace and name with `-`, so distinct owners such as
/// `x/a-b` and `x-a/b` map to the same volume.
fn foreign_owner(pv: &PersistentVolume, sv: &SharedVolume) -> Option<NamespacedName> {
    owner_of(pv).filter(|owner| *owner != sv.owner_key())
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Reconciler holding the stores and the Ensurable cache
    pub reconciler: SharedVolumeReconciler,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-SharedVolume error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl ControllerContext {
    pub fn new(reconciler: SharedVolumeReconciler, metrics: Option<ControllerMetrics>) -> Self {
        Self {
            reconciler,
            metrics,
            error_counts: dashmap::DashMap::new(),
        }
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for passes that asked to run again
    pub requeues: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("aws_efs_operator_reconciliations_total"),
            errors: metrics::counter!("aws_efs_operator_reconciliation_errors_total"),
            requeues: metrics::counter!("aws_efs_operator_requeues_total"),
            duration: metrics::histogram!("aws_efs_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the SharedVolume controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: VolumeConfig,
) -> Result<()> {
    let shared_volumes: Api<SharedVolume> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    // Volumes are cluster-scoped and always watched cluster-wide
    let volumes = Api::<PersistentVolume>::all(client.clone());
    let claims = match &namespace {
        Some(ns) => Api::<PersistentVolumeClaim>::namespaced(client.clone(), ns),
        None => Api::<PersistentVolumeClaim>::all(client.clone()),
    };

    let reconciler = SharedVolumeReconciler::new(
        Stores::from_client(client.clone()),
        Arc::new(EnsurableCache::new()),
        config,
    );
    let ctx = Arc::new(ControllerContext::new(
        reconciler,
        Some(ControllerMetrics::new()),
    ));

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting SharedVolume controller"
    );

    let selector = managed_selector();
    let managed = Config::default().labels(&selector);

    Controller::new(shared_volumes, Config::default())
        .watches(volumes, managed.clone(), |pv| shared_volume_for(&pv))
        .watches(claims, managed, |pvc| shared_volume_for(&pvc))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Controller entry point wrapping [`SharedVolumeReconciler::reconcile`]
#[instrument(skip(sv, ctx), fields(name = %sv.name_any(), namespace = sv.namespace()))]
async fn reconcile(sv: Arc<SharedVolume>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = sv.owner_key();
    let result = ctx.reconciler.reconcile(&key).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&key.to_string());
            Ok(action_for(outcome, ctx.metrics.as_ref()))
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

fn action_for(outcome: Outcome, metrics: Option<&ControllerMetrics>) -> Action {
    match outcome {
        Outcome::Requeue => {
            if let Some(metrics) = metrics {
                metrics.requeues.increment(1);
            }
            Action::requeue(Duration::ZERO)
        }
        Outcome::Done => Action::await_change(),
    }
}

/// Exponential backoff: 30s → 60s → 120s → 240s → 480s → 600s (capped)
fn backoff_delay(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

/// Error policy for the controller
fn error_policy(sv: Arc<SharedVolume>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = sv.owner_key().to_string();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = if error.is_retryable() {
        error
            .requeue_delay()
            .unwrap_or_else(|| backoff_delay(retries))
    } else {
        // Needs a change to the resource; retry slowly in case it was transient
        Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS)
    };

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
