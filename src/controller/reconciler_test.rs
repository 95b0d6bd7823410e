//! Tests for the gateway reconciler
//!
//! These tests verify:
//! - The status committed after a successful pass
//! - Auth mode selection from the gateway flag
//! - Requeue decisions of the error policy
//! - Whole gateway passes against an in-memory API server

#[cfg(test)]
mod tests {
    use super::super::conditions::{
        find_condition, is_condition_true, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_READY,
    };
    use super::super::reconciler::*;
    use super::super::resources::is_changed;
    use super::super::test_support::{exec_ok, FakeApiServer, FakeExecutor};
    use crate::config::OperatorConfig;
    use crate::crd::{
        AuthMode, Condition, IpsecConn, IpsecConnSpec, KeepAlived, KeepAlivedSpec,
        KeepAlivedStatus, VpnGw, VpnGwSpec, VpnGwStatus, WorkloadType, SCOPE_LABEL, VPN_GW_LABEL,
    };
    use crate::error::Error;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use kube::api::ObjectMeta;
    use kube::runtime::controller::Action;
    use kube::Client;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_gateway(generation: i64) -> VpnGw {
        VpnGw {
            metadata: ObjectMeta {
                name: Some("gw1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("4c1f-gw1".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: VpnGwSpec {
                keepalived: "ka1".to_string(),
                workload_type: WorkloadType::StatefulSet,
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
                qos_bandwidth: "20".to_string(),
                replicas: 2,
                selector: vec![],
                tolerations: vec![],
                affinity: None,
                enable_ssl_vpn: false,
                ssl_vpn_secret: String::new(),
                dh_secret: String::new(),
                ssl_vpn_cipher: String::new(),
                ssl_vpn_auth: String::new(),
                ssl_vpn_proto: String::new(),
                ssl_vpn_subnet_cidr: String::new(),
                ssl_vpn_image: String::new(),
                enable_ipsec_vpn: true,
                ipsec_secret: "ipsec-secret".to_string(),
                ipsec_vpn_image: "kubecombo/strongswan:v1".to_string(),
                ipsec_enable_psk: false,
                default_psk: None,
            },
            status: None,
        }
    }

    fn test_keepalived() -> KeepAlived {
        KeepAlived {
            metadata: ObjectMeta {
                name: Some("ka1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: KeepAlivedSpec {
                image: "kubecombo/keepalived:v1".to_string(),
                subnet: "external-subnet".to_string(),
                vip: "10.16.0.100".to_string(),
                vip_v6: None,
                nic: None,
                password_auth: None,
                verbatim_config: Default::default(),
                unicast_enabled: false,
            },
            status: Some(KeepAlivedStatus {
                router_id: 5,
                conditions: vec![],
            }),
        }
    }

    fn test_state(config: OperatorConfig) -> Arc<ControllerState> {
        let kube_config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(kube_config).unwrap();
        Arc::new(ControllerState::new(client, config))
    }

    #[test]
    fn test_build_status_commits_snapshot_and_connections() {
        let gw = test_gateway(3);
        let ka = test_keepalived();
        let status = build_status(&gw, &ka, vec!["moon-sun".to_string(), "moon-venus".to_string()]);

        assert_eq!(status.ipsec_connections, vec!["moon-sun", "moon-venus"]);
        assert_eq!(status.observed_generation, Some(3));
        assert!(is_condition_true(&status.conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&status.conditions, CONDITION_TYPE_DEGRADED));
        assert!(!is_changed(&gw.spec, &ka, Some(&status)));
    }

    #[test]
    fn test_build_status_is_stable_across_passes() {
        let mut gw = test_gateway(1);
        let ka = test_keepalived();
        gw.status = Some(build_status(&gw, &ka, vec!["moon-sun".to_string()]));

        let again = build_status(&gw, &ka, vec!["moon-sun".to_string()]);
        assert_eq!(gw.status.as_ref(), Some(&again));
    }

    #[test]
    fn test_build_status_clears_previous_failure() {
        let mut gw = test_gateway(2);
        let mut failed = Condition::ready(false, "ValidationFailed", "spec.cpu: cpu and memory are required");
        failed.last_transition_time = "2024-01-01T00:00:00Z".to_string();
        gw.status = Some(VpnGwStatus {
            conditions: vec![failed],
            ..Default::default()
        });

        let status = build_status(&gw, &test_keepalived(), vec![]);
        let ready = find_condition(&status.conditions, CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "Reconciled");
        assert_ne!(ready.last_transition_time, "2024-01-01T00:00:00Z");
        assert!(status.ipsec_connections.is_empty());
    }

    #[test]
    fn test_keepalived_change_is_visible_after_commit() {
        let mut gw = test_gateway(1);
        let ka = test_keepalived();
        gw.status = Some(build_status(&gw, &ka, vec![]));

        let mut renumbered = ka.clone();
        renumbered.status.as_mut().unwrap().router_id = 6;
        assert!(is_changed(&gw.spec, &renumbered, gw.status.as_ref()));
    }

    #[test]
    fn test_gateway_auth_mode_follows_psk_flag() {
        let mut gw = test_gateway(1);
        assert_eq!(gateway_auth_mode(&gw), AuthMode::Certificate);
        gw.spec.ipsec_enable_psk = true;
        assert_eq!(gateway_auth_mode(&gw), AuthMode::PreSharedKey);
    }

    #[tokio::test]
    async fn test_scoped_api_follows_watch_namespace() {
        let client = test_state(OperatorConfig::default()).client.clone();

        let one: kube::Api<VpnGw> = scoped_api(&client, Some("vpn"));
        assert_eq!(
            one.resource_url(),
            "/apis/vpn-gw.kubecombo.com/v1/namespaces/vpn/vpngws"
        );
        let all: kube::Api<VpnGw> = scoped_api(&client, None);
        assert_eq!(all.resource_url(), "/apis/vpn-gw.kubecombo.com/v1/vpngws");
    }

    #[tokio::test]
    async fn test_error_policy_requeues_only_retryable_errors() {
        let state = test_state(OperatorConfig {
            retry_delay: Duration::from_secs(3),
            ..Default::default()
        });
        let gw = Arc::new(test_gateway(1));

        let action = error_policy(
            gw.clone(),
            &Error::TransientInfraError("replica gw1-1 is not running yet".into()),
            state.clone(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(3)));

        let action = error_policy(
            gw,
            &Error::ValidationError("either ssl vpn or ipsec vpn should be enabled".into()),
            state,
        );
        assert_eq!(action, Action::await_change());
    }

    // ========================================================================
    // Gateway passes
    // ========================================================================

    const STATUS_PUT: &str =
        "PUT /apis/vpn-gw.kubecombo.com/v1/namespaces/default/vpngws/gw1/status";

    fn gw_labels() -> Option<std::collections::BTreeMap<String, String>> {
        Some(
            [(VPN_GW_LABEL.to_string(), "gw1".to_string())]
                .into_iter()
                .collect(),
        )
    }

    fn replica(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: gw_labels(),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    fn moon_sun() -> IpsecConn {
        IpsecConn {
            metadata: ObjectMeta {
                name: Some("moon-sun".to_string()),
                namespace: Some("default".to_string()),
                labels: gw_labels(),
                ..Default::default()
            },
            spec: IpsecConnSpec {
                vpn_gw: "gw1".to_string(),
                auth: "pubkey".to_string(),
                ike_version: "2".to_string(),
                ike_proposals: "default".to_string(),
                local_cn: "moon".to_string(),
                local_public_ip: "172.19.0.101".to_string(),
                local_private_cidrs: "10.1.0.0/24".to_string(),
                remote_cn: "sun".to_string(),
                remote_public_ip: "172.19.0.102".to_string(),
                remote_private_cidrs: "10.2.0.0/24".to_string(),
                esp_proposals: "default".to_string(),
                preshared_key: None,
                local_gateway_ip: None,
                local_gateway_nic: None,
            },
            status: None,
        }
    }

    /// gw1 with two running replicas, its keepalived and one connection
    fn cluster() -> Arc<FakeApiServer> {
        let server = FakeApiServer::new();
        let mut ka = test_keepalived();
        ka.metadata.labels = Some(
            [(SCOPE_LABEL.to_string(), ka.spec.subnet.clone())]
                .into_iter()
                .collect(),
        );
        server.insert(&ka);
        server.insert(&test_gateway(1));
        server.insert(&moon_sun());
        server.insert(&replica("gw1-0"));
        server.insert(&replica("gw1-1"));
        server
    }

    fn pass_config() -> OperatorConfig {
        OperatorConfig {
            exec_timeout: Duration::from_millis(50),
            settle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn gateway_on(server: &FakeApiServer) -> VpnGw {
        server.get::<VpnGw>("default", "gw1").unwrap()
    }

    fn position(requests: &[String], request: &str) -> usize {
        requests
            .iter()
            .position(|r| r == request)
            .unwrap_or_else(|| panic!("{request} not sent; saw {requests:?}"))
    }

    #[tokio::test]
    async fn test_replica_timeout_leaves_status_untouched() {
        let server = cluster();
        let executor = Arc::new(FakeExecutor::default().reply("gw1-0", exec_ok()));
        let ctx = ControllerState::new(server.client(), pass_config()).with_executor(executor.clone());

        let err = apply_vpn_gw(&ctx, &gateway_on(&server)).await.unwrap_err();

        assert!(err.is_retriable());
        assert!(err.to_string().contains("gw1-1"));
        assert_eq!(executor.calls().len(), 2);
        assert!(!server.requests().iter().any(|r| r == STATUS_PUT));
        assert!(gateway_on(&server).status.is_none());
        // The workload is still brought up before the refresh
        assert!(server.get::<StatefulSet>("default", "gw1").is_some());
    }

    #[tokio::test]
    async fn test_successful_pass_runs_steps_in_order() {
        let server = cluster();
        let executor = Arc::new(
            FakeExecutor::default()
                .reply("gw1-0", exec_ok())
                .reply("gw1-1", exec_ok()),
        );
        let ctx = ControllerState::new(server.client(), pass_config()).with_executor(executor.clone());

        apply_vpn_gw(&ctx, &gateway_on(&server)).await.unwrap();

        let requests = server.requests();
        let keepalived = position(
            &requests,
            "GET /apis/vpn-gw.kubecombo.com/v1/namespaces/default/keepaliveds/ka1",
        );
        let workload = position(&requests, "POST /apis/apps/v1/namespaces/default/statefulsets");
        let connections = position(
            &requests,
            "GET /apis/vpn-gw.kubecombo.com/v1/namespaces/default/ipsecconns",
        );
        let pods = position(&requests, "GET /api/v1/namespaces/default/pods");
        let status = position(&requests, STATUS_PUT);
        assert!(keepalived < workload);
        assert!(workload < connections);
        assert!(connections < pods);
        assert!(pods < status);

        let committed = gateway_on(&server).status.unwrap();
        assert_eq!(committed.ipsec_connections, vec!["moon-sun"]);
        assert!(is_condition_true(&committed.conditions, CONDITION_TYPE_READY));
        for (_, container, command) in executor.calls() {
            assert_eq!(container, "ipsec-vpn");
            assert_eq!(command[1], "refresh-x509");
        }
    }

    #[tokio::test]
    async fn test_repeat_pass_without_changes_writes_nothing() {
        let server = cluster();
        let executor = Arc::new(
            FakeExecutor::default()
                .reply("gw1-0", exec_ok())
                .reply("gw1-1", exec_ok()),
        );
        let ctx = ControllerState::new(server.client(), pass_config()).with_executor(executor.clone());

        apply_vpn_gw(&ctx, &gateway_on(&server)).await.unwrap();
        server.clear_requests();

        apply_vpn_gw(&ctx, &gateway_on(&server)).await.unwrap();

        assert_eq!(server.writes(), Vec::<String>::new());
        // The table is still pushed on every pass
        assert_eq!(executor.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_connection_fails_the_batch_before_any_exec() {
        let server = cluster();
        let mut bad = moon_sun();
        bad.metadata.name = Some("moon-mars".to_string());
        bad.spec.remote_public_ip = "172.19.0.103 172.19.0.104".to_string();
        server.insert(&bad);
        let executor = Arc::new(
            FakeExecutor::default()
                .reply("gw1-0", exec_ok())
                .reply("gw1-1", exec_ok()),
        );
        let ctx = ControllerState::new(server.client(), pass_config()).with_executor(executor.clone());

        let err = apply_vpn_gw(&ctx, &gateway_on(&server)).await.unwrap_err();

        assert!(matches!(err, Error::ValidationError(_)));
        assert!(err.to_string().contains("moon-mars"));
        assert!(executor.calls().is_empty());
        assert!(!server.requests().iter().any(|r| r == STATUS_PUT));
    }

    #[tokio::test]
    async fn test_missing_keepalived_is_retryable_and_writes_nothing() {
        let server = FakeApiServer::new();
        server.insert(&test_gateway(1));
        let ctx = ControllerState::new(server.client(), pass_config())
            .with_executor(Arc::new(FakeExecutor::default()));

        let err = apply_vpn_gw(&ctx, &gateway_on(&server)).await.unwrap_err();

        assert!(err.is_retriable());
        assert_eq!(server.writes(), Vec::<String>::new());
    }
}
