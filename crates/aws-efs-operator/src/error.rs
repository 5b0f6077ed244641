//! Error types for the AWS EFS operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic-concurrency conflict or an object that already exists
    #[error("Conflict on {kind}/{name}: {reason}")]
    Conflict {
        kind: String,
        name: String,
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Build a `NotFound` for the given kind and identity.
    pub fn not_found(kind: &str, name: &str, namespace: Option<&str>) -> Self {
        OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.unwrap_or_default().to_string(),
        }
    }

    /// Translate a kube client error, classifying 404 and 409 responses.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str, namespace: Option<&str>) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name, namespace),
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                reason: ae.message,
            },
            other => OperatorError::KubeError(other),
        }
    }

    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Whether this error is a write conflict (stale version or already exists)
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict { .. } => true,
            OperatorError::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::NotFound { .. }
                | OperatorError::Conflict { .. }
                | OperatorError::ReconcileFailed(_)
                | OperatorError::FinalizerError(_)
        )
    }

    /// Get a suggested requeue delay for errors that should not wait out the full backoff
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_conflict() {
            // Someone else wrote first; the next pass will see their version.
            Some(std::time::Duration::from_secs(1))
        } else {
            None
        }
    }
}
