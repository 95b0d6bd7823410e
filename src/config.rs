//! Runtime configuration shared by the controllers

use std::time::Duration;

/// Kubelet static pod manifest directory on the gateway nodes
pub const DEFAULT_K8S_MANIFESTS_PATH: &str = "/etc/kubernetes/manifests";

/// Knobs of the operator, filled from the command line in `main`
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; every namespace when unset
    pub watch_namespace: Option<String>,
    /// Host directory the static-pod setup scripts install manifests into
    pub k8s_manifests_path: String,
    /// Deadline for a single pod exec
    pub exec_timeout: Duration,
    /// Requeue delay after a retryable failure
    pub retry_delay: Duration,
    /// Wait after creating or updating a workload
    pub settle_delay: Duration,
    /// Concurrent reconciliations per controller
    pub workers: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            k8s_manifests_path: DEFAULT_K8S_MANIFESTS_PATH.to_string(),
            exec_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(3),
            settle_delay: Duration::from_secs(5),
            workers: 4,
        }
    }
}
