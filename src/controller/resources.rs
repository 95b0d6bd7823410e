//! Kubernetes workload builders for VpnGw
//!
//! A gateway becomes either a StatefulSet or, for the static topology, a
//! host-network DaemonSet whose pods install a kubelet static pod.
//! Building is pure; [`ensure_workload`] applies the result.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, StatefulSet, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::OperatorConfig;
use crate::crd::{KeepAlived, VpnGw, VpnGwSpec, VpnGwStatus, WorkloadSnapshot, WorkloadType, VPN_GW_LABEL};
use crate::error::{Error, Result};

// Container names
pub const SSL_VPN_CONTAINER: &str = "ssl-vpn";
pub const IPSEC_VPN_CONTAINER: &str = "ipsec-vpn";
pub const KEEPALIVED_CONTAINER: &str = "keepalived";

// Ports
pub const SSL_VPN_UDP_PORT: i32 = 1194;
pub const SSL_VPN_TCP_PORT: i32 = 443;
pub const IPSEC_ISAKMP_PORT: i32 = 500;
pub const IPSEC_BOOTPC_PORT: i32 = 68;
pub const IPSEC_NAT_PORT: i32 = 4500;

// Commands
const SSL_VPN_STS_CMD: &str = "/etc/openvpn/setup/configure.sh";
const SSL_VPN_DS_CMD: &str = "/etc/openvpn/setup/daemonset-start.sh";
const IPSEC_VPN_STS_CMD: &str = "/usr/sbin/charon-systemd";
const IPSEC_VPN_DS_CMD: &str = "/etc/ipsec/setup/daemonset-start.sh";
const KEEPALIVED_CMD: &str = "/configure.sh";

// Mount paths
const SSL_VPN_SECRET_PATH: &str = "/etc/openvpn/certmanager";
const DH_SECRET_PATH: &str = "/etc/openvpn/dh";
const IPSEC_VPN_SECRET_PATH: &str = "/etc/ipsec/certs";
const OPENVPN_CACHE_PATH: &str = "/etc/host-init-openvpn";
const STRONGSWAN_CACHE_PATH: &str = "/etc/host-init-strongswan";

// Volume names
const SSL_VPN_SECRET_VOLUME: &str = "ssl-vpn-secret";
const DH_SECRET_VOLUME: &str = "dh-secret";
const IPSEC_VPN_SECRET_VOLUME: &str = "ipsec-vpn-secret";
const OPENVPN_CACHE_VOLUME: &str = "openvpn-cache";
const STRONGSWAN_CACHE_VOLUME: &str = "strongswan-cache";
const K8S_MANIFESTS_VOLUME: &str = "k8s-manifests";

// Pod annotations understood by kube-ovn
pub const LOGICAL_SWITCH_ANNOTATION: &str = "ovn.kubernetes.io/logical_switch";
pub const INGRESS_RATE_ANNOTATION: &str = "ovn.kubernetes.io/ingress_rate";
pub const EGRESS_RATE_ANNOTATION: &str = "ovn.kubernetes.io/egress_rate";

pub const ENABLE_SSL_VPN_LABEL: &str = "enable-ssl-vpn";
pub const ENABLE_IPSEC_VPN_LABEL: &str = "enable-ipsec-vpn";

/// Labels that select the pods of a gateway; stable for the gateway's lifetime
pub fn selector_labels(gw: &VpnGw) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "vpn-gw".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), gw.name_any());
    labels.insert(VPN_GW_LABEL.to_string(), gw.name_any());
    labels
}

/// Get the standard labels for a VpnGw's resources
pub fn standard_labels(gw: &VpnGw) -> BTreeMap<String, String> {
    let mut labels = selector_labels(gw);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "kube-combo-operator".to_string(),
    );
    labels.insert(
        ENABLE_SSL_VPN_LABEL.to_string(),
        gw.spec.enable_ssl_vpn.to_string(),
    );
    labels.insert(
        ENABLE_IPSEC_VPN_LABEL.to_string(),
        gw.spec.enable_ipsec_vpn.to_string(),
    );
    labels
}

/// Controller owner reference, so deleting the gateway removes its workload
pub fn owner_reference(gw: &VpnGw) -> Result<OwnerReference> {
    gw.controller_owner_ref(&()).ok_or_else(|| {
        Error::OwnershipError(format!(
            "vpn gw {} has no uid; cannot own its workload",
            gw.name_any()
        ))
    })
}

/// Whether the workload inputs differ from what status last recorded
pub fn is_changed(spec: &VpnGwSpec, ka: &KeepAlived, status: Option<&VpnGwStatus>) -> bool {
    let current = WorkloadSnapshot::observe(spec, ka);
    status.and_then(|s| s.applied.as_ref()) != Some(&current)
}

/// Observed annotations overlaid with the ones this operator owns
pub fn merge_pod_annotations(
    gw: &VpnGw,
    ka: &KeepAlived,
    observed: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut annotations = observed.cloned().unwrap_or_default();
    annotations.insert(
        LOGICAL_SWITCH_ANNOTATION.to_string(),
        ka.spec.subnet.clone(),
    );
    annotations.insert(
        INGRESS_RATE_ANNOTATION.to_string(),
        gw.spec.qos_bandwidth.clone(),
    );
    annotations.insert(
        EGRESS_RATE_ANNOTATION.to_string(),
        gw.spec.qos_bandwidth.clone(),
    );
    annotations
}

// ============================================================================
// Containers
// ============================================================================

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn udp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("UDP".to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

fn resources(spec: &VpnGwSpec) -> ResourceRequirements {
    let mut quantities = BTreeMap::new();
    quantities.insert("cpu".to_string(), Quantity(spec.cpu.clone()));
    quantities.insert("memory".to_string(), Quantity(spec.memory.clone()));

    ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        allow_privilege_escalation: Some(true),
        ..Default::default()
    }
}

/// Port the SSL VPN listens on for the configured protocol
pub fn ssl_vpn_port(proto: &str) -> i32 {
    if proto == "tcp" {
        SSL_VPN_TCP_PORT
    } else {
        SSL_VPN_UDP_PORT
    }
}

fn build_ssl_container(gw: &VpnGw, ka: &KeepAlived, config: &OperatorConfig) -> Container {
    let spec = &gw.spec;
    let port = ssl_vpn_port(&spec.ssl_vpn_proto);
    let is_static = spec.workload_type == WorkloadType::Static;

    let mut env_vars = vec![
        env("SSL_VPN_PROTO", spec.ssl_vpn_proto.clone()),
        env("SSL_VPN_PORT", port.to_string()),
        env("SSL_VPN_CIPHER", spec.ssl_vpn_cipher.clone()),
        env("SSL_VPN_AUTH", spec.ssl_vpn_auth.clone()),
        env("SSL_VPN_SUBNET_CIDR", spec.ssl_vpn_subnet_cidr.clone()),
        env("KEEPALIVED_VIP", ka.spec.vip.clone()),
    ];
    let mut mounts = vec![
        mount(SSL_VPN_SECRET_VOLUME, SSL_VPN_SECRET_PATH, true),
        mount(DH_SECRET_VOLUME, DH_SECRET_PATH, true),
    ];
    if is_static {
        env_vars.push(env("SSL_VPN_IMAGE", spec.ssl_vpn_image.clone()));
        env_vars.push(env("K8S_MANIFESTS_PATH", config.k8s_manifests_path.clone()));
        mounts.push(mount(OPENVPN_CACHE_VOLUME, OPENVPN_CACHE_PATH, false));
        mounts.push(mount(K8S_MANIFESTS_VOLUME, &config.k8s_manifests_path, false));
    }

    Container {
        name: SSL_VPN_CONTAINER.to_string(),
        image: Some(spec.ssl_vpn_image.clone()),
        command: Some(vec![if is_static { SSL_VPN_DS_CMD } else { SSL_VPN_STS_CMD }.to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some(SSL_VPN_CONTAINER.to_string()),
            container_port: port,
            protocol: Some(spec.ssl_vpn_proto.to_uppercase()),
            ..Default::default()
        }]),
        env: Some(env_vars),
        volume_mounts: Some(mounts),
        resources: Some(resources(spec)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

fn build_ipsec_container(gw: &VpnGw, config: &OperatorConfig) -> Container {
    let spec = &gw.spec;
    let is_static = spec.workload_type == WorkloadType::Static;

    let mut env_vars = Vec::new();
    let mut mounts = vec![mount(IPSEC_VPN_SECRET_VOLUME, IPSEC_VPN_SECRET_PATH, true)];
    if is_static {
        env_vars.push(env("IPSEC_VPN_IMAGE", spec.ipsec_vpn_image.clone()));
        env_vars.push(env("K8S_MANIFESTS_PATH", config.k8s_manifests_path.clone()));
        mounts.push(mount(STRONGSWAN_CACHE_VOLUME, STRONGSWAN_CACHE_PATH, false));
        mounts.push(mount(K8S_MANIFESTS_VOLUME, &config.k8s_manifests_path, false));
    }

    Container {
        name: IPSEC_VPN_CONTAINER.to_string(),
        image: Some(spec.ipsec_vpn_image.clone()),
        command: Some(vec![if is_static { IPSEC_VPN_DS_CMD } else { IPSEC_VPN_STS_CMD }.to_string()]),
        ports: Some(vec![
            udp_port("isakmp", IPSEC_ISAKMP_PORT),
            udp_port("bootpc", IPSEC_BOOTPC_PORT),
            udp_port("nat", IPSEC_NAT_PORT),
        ]),
        env: if env_vars.is_empty() { None } else { Some(env_vars) },
        volume_mounts: Some(mounts),
        resources: Some(resources(spec)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

fn build_keepalived_container(gw: &VpnGw, ka: &KeepAlived) -> Container {
    let mut env_vars = vec![
        env("KEEPALIVED_VIP", ka.spec.vip.clone()),
        env("KEEPALIVED_VIRTUAL_ROUTER_ID", ka.router_id().to_string()),
    ];
    if let Some(nic) = &ka.spec.nic {
        env_vars.push(env("KEEPALIVED_NIC", nic.clone()));
    }

    Container {
        name: KEEPALIVED_CONTAINER.to_string(),
        image: Some(ka.spec.image.clone()),
        command: Some(vec![KEEPALIVED_CMD.to_string()]),
        env: Some(env_vars),
        resources: Some(resources(&gw.spec)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(privileged()),
        ..Default::default()
    }
}

// ============================================================================
// Pod template
// ============================================================================

fn build_pod_template(
    gw: &VpnGw,
    ka: &KeepAlived,
    observed_annotations: Option<&BTreeMap<String, String>>,
    config: &OperatorConfig,
) -> PodTemplateSpec {
    let spec = &gw.spec;
    let is_static = spec.workload_type == WorkloadType::Static;

    let mut containers = Vec::new();
    let mut volumes = Vec::new();

    if spec.enable_ssl_vpn {
        containers.push(build_ssl_container(gw, ka, config));
        volumes.push(secret_volume(SSL_VPN_SECRET_VOLUME, &spec.ssl_vpn_secret));
        volumes.push(secret_volume(DH_SECRET_VOLUME, &spec.dh_secret));
        if is_static {
            volumes.push(host_path_volume(OPENVPN_CACHE_VOLUME, OPENVPN_CACHE_PATH));
        }
    }
    if spec.enable_ipsec_vpn {
        containers.push(build_ipsec_container(gw, config));
        volumes.push(secret_volume(IPSEC_VPN_SECRET_VOLUME, &spec.ipsec_secret));
        if is_static {
            volumes.push(host_path_volume(STRONGSWAN_CACHE_VOLUME, STRONGSWAN_CACHE_PATH));
        }
    }
    if is_static {
        volumes.push(host_path_volume(K8S_MANIFESTS_VOLUME, &config.k8s_manifests_path));
    }
    containers.push(build_keepalived_container(gw, ka));

    let node_selector = spec.node_selector();

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(standard_labels(gw)),
            annotations: Some(merge_pod_annotations(gw, ka, observed_annotations)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            volumes: Some(volumes),
            node_selector: if node_selector.is_empty() { None } else { Some(node_selector) },
            tolerations: if spec.tolerations.is_empty() {
                None
            } else {
                Some(spec.tolerations.clone())
            },
            affinity: spec.affinity.clone(),
            host_network: is_static.then_some(true),
            dns_policy: is_static.then(|| "ClusterFirstWithHostNet".to_string()),
            ..Default::default()
        }),
    }
}

fn workload_metadata(gw: &VpnGw) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(gw.name_any()),
        namespace: gw.namespace(),
        labels: Some(standard_labels(gw)),
        owner_references: Some(vec![owner_reference(gw)?]),
        ..Default::default()
    })
}

fn require_router_id(ka: &KeepAlived) -> Result<()> {
    if ka.router_id() == 0 {
        return Err(Error::TransientInfraError(format!(
            "keepalived {} has no router id yet",
            ka.name_any()
        )));
    }
    Ok(())
}

// ============================================================================
// Workloads
// ============================================================================

/// Replicated gateway with a rolling update strategy
pub fn build_statefulset(
    gw: &VpnGw,
    ka: &KeepAlived,
    observed_annotations: Option<&BTreeMap<String, String>>,
    config: &OperatorConfig,
) -> Result<StatefulSet> {
    require_router_id(ka)?;

    Ok(StatefulSet {
        metadata: workload_metadata(gw)?,
        spec: Some(StatefulSetSpec {
            replicas: Some(gw.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(gw)),
                ..Default::default()
            },
            service_name: gw.name_any(),
            template: build_pod_template(gw, ka, observed_annotations, config),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// One host-network gateway pod per selected node
pub fn build_daemonset(
    gw: &VpnGw,
    ka: &KeepAlived,
    observed_annotations: Option<&BTreeMap<String, String>>,
    config: &OperatorConfig,
) -> Result<DaemonSet> {
    require_router_id(ka)?;

    Ok(DaemonSet {
        metadata: workload_metadata(gw)?,
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(gw)),
                ..Default::default()
            },
            template: build_pod_template(gw, ka, observed_annotations, config),
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Workload computed for a gateway
#[derive(Clone, Debug, PartialEq)]
pub enum DesiredWorkload {
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

pub fn build_workload(
    gw: &VpnGw,
    ka: &KeepAlived,
    observed_annotations: Option<&BTreeMap<String, String>>,
    config: &OperatorConfig,
) -> Result<DesiredWorkload> {
    match gw.spec.workload_type {
        WorkloadType::StatefulSet => {
            build_statefulset(gw, ka, observed_annotations, config).map(DesiredWorkload::StatefulSet)
        }
        WorkloadType::Static => {
            build_daemonset(gw, ka, observed_annotations, config).map(DesiredWorkload::DaemonSet)
        }
    }
}

/// Kinds a gateway can be synthesized into
pub trait GatewayWorkload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn template_annotations(&self) -> Option<&BTreeMap<String, String>>;
}

impl GatewayWorkload for StatefulSet {
    fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
    }
}

impl GatewayWorkload for DaemonSet {
    fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
    }
}

fn is_controlled_by<K: Resource>(obj: &K, gw: &VpnGw) -> bool {
    let uid = gw.uid();
    obj.owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && Some(&o.uid) == uid.as_ref())
}

/// Create the child if absent, replace it if `changed`, otherwise leave it.
/// Returns whether anything was written.
async fn apply_workload<K: GatewayWorkload>(
    api: &Api<K>,
    gw: &VpnGw,
    mut desired: K,
    existing: Option<K>,
    changed: bool,
) -> Result<bool> {
    let kind = K::kind(&());
    let name = desired.name_any();

    match existing {
        None => {
            info!("Creating {} {}", kind, name);
            api.create(&PostParams::default(), &desired)
                .await
                .map_err(|e| Error::from_write(e, &format!("{kind} {name}")))?;
            Ok(true)
        }
        Some(current) if !is_controlled_by(&current, gw) => Err(Error::OwnershipError(format!(
            "{kind} {name} exists but is not controlled by vpn gw {}",
            gw.name_any()
        ))),
        Some(current) if changed => {
            info!("Updating {} {}", kind, name);
            let meta = desired.meta_mut();
            meta.resource_version = current.resource_version();
            if let Some(observed) = current.meta().annotations.clone() {
                let mut merged = observed;
                merged.extend(meta.annotations.take().unwrap_or_default());
                meta.annotations = Some(merged);
            }
            api.replace(&name, &PostParams::default(), &desired)
                .await
                .map_err(|e| Error::from_write(e, &format!("{kind} {name}")))?;
            Ok(true)
        }
        Some(_) => {
            debug!("{} {} is up to date", kind, name);
            Ok(false)
        }
    }
}

/// Remove the workload of the topology the gateway no longer uses
async fn remove_stale_workload<K: GatewayWorkload>(api: &Api<K>, gw: &VpnGw) -> Result<()> {
    let name = gw.name_any();
    if let Some(stale) = api.get_opt(&name).await? {
        if is_controlled_by(&stale, gw) {
            info!("Deleting {} {} left by a topology change", K::kind(&()), name);
            api.delete(&name, &DeleteParams::default()).await?;
        }
    }
    Ok(())
}

/// Bring the gateway's workload in line with its spec.
///
/// Sleeps for the settle delay after any create or update. Returns whether
/// the workload was written.
#[instrument(skip(client, gw, ka, config), fields(name = %gw.name_any(), namespace = gw.namespace()))]
pub async fn ensure_workload(
    client: &Client,
    gw: &VpnGw,
    ka: &KeepAlived,
    config: &OperatorConfig,
) -> Result<bool> {
    let namespace = gw.namespace().unwrap_or_else(|| "default".to_string());
    let name = gw.name_any();
    let changed = is_changed(&gw.spec, ka, gw.status.as_ref());
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);

    let written = match gw.spec.workload_type {
        WorkloadType::StatefulSet => {
            let existing = statefulsets.get_opt(&name).await?;
            let desired = build_statefulset(
                gw,
                ka,
                existing.as_ref().and_then(|w| w.template_annotations()),
                config,
            )?;
            let written = apply_workload(&statefulsets, gw, desired, existing, changed).await?;
            remove_stale_workload(&daemonsets, gw).await?;
            written
        }
        WorkloadType::Static => {
            let existing = daemonsets.get_opt(&name).await?;
            let desired = build_daemonset(
                gw,
                ka,
                existing.as_ref().and_then(|w| w.template_annotations()),
                config,
            )?;
            let written = apply_workload(&daemonsets, gw, desired, existing, changed).await?;
            remove_stale_workload(&statefulsets, gw).await?;
            written
        }
    };

    if written {
        debug!("Waiting {:?} for the workload to settle", config.settle_delay);
        tokio::time::sleep(config.settle_delay).await;
    }
    Ok(written)
}
