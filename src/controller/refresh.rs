//! Live refresh of the IPsec connections inside running gateway pods
//!
//! The table is pushed with one exec per replica into the strongSwan
//! container. The workload is never recreated for a connection change.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

use super::connections::ConnectionTable;
use super::resources::IPSEC_VPN_CONTAINER;
use crate::crd::VPN_GW_LABEL;
use crate::error::{Error, Result};

/// What came back from one exec
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status reported as success
    pub success: bool,
    /// Status message of a failed command
    pub message: Option<String>,
}

/// Runs a command in a container and waits for it to finish
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// Exec over the Kubernetes API websocket
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_stream(stream: Option<impl AsyncRead + Unpin>) -> Result<String> {
    let mut out = String::new();
    if let Some(mut stream) = stream {
        stream
            .read_to_string(&mut out)
            .await
            .map_err(|e| Error::TransientInfraError(format!("reading exec output: {e}")))?;
    }
    Ok(out)
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods.exec(pod, command, &params).await.map_err(|e| {
            Error::TransientInfraError(format!("exec into {namespace}/{pod} failed: {e}"))
        })?;

        let (stdout, stderr) =
            tokio::try_join!(read_stream(attached.stdout()), read_stream(attached.stderr()))?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            .unwrap_or(false);

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
            message: status.and_then(|s| s.message),
        })
    }
}

/// Pods carrying the gateway label
#[instrument(skip(client))]
pub async fn list_gateway_pods(client: &Client, namespace: &str, gateway: &str) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{VPN_GW_LABEL}={gateway}");
    Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
}

fn is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// Push `table` into every replica, failing as a whole if any replica does.
///
/// Nothing is pushed unless every replica is running. Each exec is bounded
/// by `exec_timeout`.
#[instrument(skip(executor, pods, table), fields(replicas = pods.len(), connections = table.connections().len()))]
pub async fn refresh_connections(
    executor: &dyn PodExecutor,
    gateway: &str,
    pods: &[Pod],
    table: &ConnectionTable,
    exec_timeout: Duration,
) -> Result<()> {
    if pods.is_empty() {
        return Err(Error::TransientInfraError(format!(
            "vpn gw {gateway} has no replicas yet"
        )));
    }
    if let Some(pending) = pods.iter().find(|p| !is_running(p)) {
        return Err(Error::TransientInfraError(format!(
            "vpn gw {gateway} replica {} is not running yet",
            pending.name_any()
        )));
    }

    let command = table.refresh_command();
    for pod in pods {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        debug!("Refreshing {} connections in {}/{}", table.mode(), namespace, name);

        let result = tokio::time::timeout(
            exec_timeout,
            executor.exec(&namespace, &name, IPSEC_VPN_CONTAINER, command.clone()),
        )
        .await;

        let outcome = match result {
            Err(_) => Err(format!("timed out after {exec_timeout:?}")),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(output)) if !output.stderr.is_empty() => {
                Err(format!("stderr: {:?}", output.stderr))
            }
            Ok(Ok(output)) if !output.success => Err(format!(
                "command failed: {}",
                output.message.as_deref().unwrap_or("non-zero exit")
            )),
            Ok(Ok(_)) => Ok(()),
        };

        #[cfg(feature = "metrics")]
        super::metrics::inc_exec(if outcome.is_ok() { "success" } else { "failure" });

        if let Err(why) = outcome {
            warn!(
                "Refreshing ipsec connections in {}/{} failed: {}",
                namespace, name, why
            );
            return Err(Error::TransientInfraError(format!(
                "refreshing ipsec connections in {namespace}/{name}: {why}"
            )));
        }
    }

    info!(
        "Refreshed {} ipsec connections on {} replicas of vpn gw {}",
        table.connections().len(),
        pods.len(),
        gateway
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::connections::{CertificateConnection, Connection};
    use crate::controller::test_support::{exec_ok as ok, FakeExecutor};
    use crate::crd::AuthMode;
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn table() -> ConnectionTable {
        ConnectionTable::new(
            AuthMode::Certificate,
            vec![Connection::Certificate(CertificateConnection {
                name: "moon-sun".to_string(),
                ike_version: "2".to_string(),
                ike_proposals: "default".to_string(),
                local_cn: "moon".to_string(),
                local_public_ip: "172.19.0.101".to_string(),
                local_private_cidrs: "10.1.0.0/24".to_string(),
                remote_cn: "sun".to_string(),
                remote_public_ip: "172.19.0.102".to_string(),
                remote_private_cidrs: "10.2.0.0/24".to_string(),
            })],
        )
        .unwrap()
    }

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_every_replica_receives_the_table() {
        let executor = FakeExecutor::default()
            .reply("gw1-0", ok())
            .reply("gw1-1", ok());
        let pods = vec![pod("gw1-0", "Running"), pod("gw1-1", "Running")];

        tokio_test::assert_ok!(refresh_connections(&executor, "gw1", &pods, &table(), TIMEOUT).await);

        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        for (_, container, command) in calls {
            assert_eq!(container, "ipsec-vpn");
            assert_eq!(command, table().refresh_command());
        }
    }

    #[tokio::test]
    async fn test_timeout_on_second_replica_fails_refresh() {
        let executor = FakeExecutor::default().reply("gw1-0", ok());
        let pods = vec![pod("gw1-0", "Running"), pod("gw1-1", "Running")];

        let err = tokio_test::assert_err!(
            refresh_connections(&executor, "gw1", &pods, &table(), TIMEOUT).await
        );
        assert!(matches!(err, Error::TransientInfraError(_)));
        assert!(err.to_string().contains("gw1-1"));
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_replica_blocks_any_push() {
        let executor = FakeExecutor::default()
            .reply("gw1-0", ok())
            .reply("gw1-1", ok());
        let pods = vec![pod("gw1-0", "Running"), pod("gw1-1", "Pending")];

        let err = refresh_connections(&executor, "gw1", &pods, &table(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_replicas_is_retryable() {
        let executor = FakeExecutor::default();
        let err = refresh_connections(&executor, "gw1", &[], &table(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransientInfraError(_)));
    }

    #[tokio::test]
    async fn test_stderr_output_is_a_failure() {
        let noisy = ExecOutput {
            stderr: "swanctl: loading connection failed".to_string(),
            success: true,
            ..Default::default()
        };
        let executor = FakeExecutor::default().reply("gw1-0", noisy);
        let pods = vec![pod("gw1-0", "Running")];

        let err = refresh_connections(&executor, "gw1", &pods, &table(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loading connection failed"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_failure() {
        let failed = ExecOutput {
            success: false,
            message: Some("command terminated with non-zero exit code".to_string()),
            ..Default::default()
        };
        let executor = FakeExecutor::default().reply("gw1-0", failed);
        let pods = vec![pod("gw1-0", "Running")];

        let err = refresh_connections(&executor, "gw1", &pods, &table(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_whitespace_only_stderr_is_a_failure() {
        let noisy = ExecOutput {
            stdout: "reloaded".to_string(),
            stderr: "\n".to_string(),
            success: true,
            ..Default::default()
        };
        let executor = FakeExecutor::default().reply("gw1-0", noisy);
        let pods = vec![pod("gw1-0", "Running")];

        let err = refresh_connections(&executor, "gw1", &pods, &table(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stderr"));
    }
}
