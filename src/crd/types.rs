//! Shared types for the kube-combo custom resources
//!
//! These types are used across the CRD definitions and controller logic.
//!
//! - [`WorkloadType`] - Topology of the gateway workload (StatefulSet or per-node static pods)
//! - [`Condition`] - Kubernetes-style status condition
//! - [`SpecValidationError`] - Structured validation failure reported by `validate()`

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Topology of the synthesized gateway workload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum WorkloadType {
    /// Replicated StatefulSet with a rolling update strategy
    #[default]
    #[serde(rename = "statefulset")]
    StatefulSet,

    /// One host-network pod per node, installed as a kubelet static pod
    #[serde(rename = "static")]
    Static,
}

impl std::fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadType::StatefulSet => write!(f, "statefulset"),
            WorkloadType::Static => write!(f, "static"),
        }
    }
}

/// Structured validation error for the custom resource specs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

/// Join validation errors into a single human-readable message
pub fn format_validation_errors(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Kubernetes-style condition for status reporting
///
/// ```rust,no_run
/// use kube_combo::crd::Condition;
///
/// let condition = Condition::ready(true, "Reconciled", "Gateway is serving");
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation the condition was set based upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Set the observed generation for this condition
    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}
