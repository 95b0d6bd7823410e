//! Error types for the kube-combo operator

use thiserror::Error;

use crate::crd::{format_validation_errors, SpecValidationError};

/// Result alias used throughout the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Malformed or incomplete spec; needs an operator edit
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Every router id in the scope is taken
    #[error("Router id capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Store conflict, object not found yet, replica not running or exec failure
    #[error("Transient infrastructure error: {0}")]
    TransientInfraError(String),

    /// The child workload cannot be linked to its owner
    #[error("Ownership error: {0}")]
    OwnershipError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<Vec<SpecValidationError>> for Error {
    fn from(errors: Vec<SpecValidationError>) -> Self {
        Error::ValidationError(format_validation_errors(&errors))
    }
}

impl Error {
    /// Whether the reconciliation should be retried after the fixed delay
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::TransientInfraError(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => !matches!(resp.code, 400 | 403 | 422),
            Error::KubeError(_) => true,
            Error::ValidationError(_)
            | Error::CapacityExhausted(_)
            | Error::OwnershipError(_)
            | Error::SerializationError(_)
            | Error::ConfigError(_) => false,
        }
    }

    /// Short label for metrics and condition reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ValidationError(_) => "validation",
            Error::CapacityExhausted(_) => "capacity_exhausted",
            Error::TransientInfraError(_) => "transient",
            Error::OwnershipError(_) => "ownership",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
        }
    }

    /// Map a kube API error to a transient failure when it is a write conflict
    pub fn from_write(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => {
                Error::TransientInfraError(format!("conflict writing {what}: {}", resp.message))
            }
            other => Error::KubeError(other),
        }
    }
}
