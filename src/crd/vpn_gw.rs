//! VpnGw custom resource: one SSL and/or IPsec gateway fronted by a KeepAlived VIP

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::keep_alived::KeepAlived;
use super::types::{Condition, SpecValidationError, WorkloadType};

fn default_replicas() -> i32 {
    1
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vpn-gw.kubecombo.com",
    version = "v1",
    kind = "VpnGw",
    namespaced,
    status = "VpnGwStatus",
    shortname = "vpngw",
    printcolumn = r#"{"name":"Keepalived","type":"string","jsonPath":".spec.keepalived"}"#,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workloadType"}"#,
    printcolumn = r#"{"name":"SSL","type":"boolean","jsonPath":".spec.enableSslVpn"}"#,
    printcolumn = r#"{"name":"IPsec","type":"boolean","jsonPath":".spec.enableIpsecVpn"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VpnGwSpec {
    /// Name of the KeepAlived in the same namespace
    pub keepalived: String,

    #[serde(default)]
    pub workload_type: WorkloadType,

    pub cpu: String,
    pub memory: String,

    /// Applied as both ingress and egress rate on the gateway pods
    pub qos_bandwidth: String,

    /// Replica count, honoured by the statefulset topology only
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Node selector entries in `key:value` form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub affinity: Option<Affinity>,

    // SSL VPN (OpenVPN)
    #[serde(default)]
    pub enable_ssl_vpn: bool,
    #[serde(default)]
    pub ssl_vpn_secret: String,
    #[serde(default)]
    pub dh_secret: String,
    #[serde(default)]
    pub ssl_vpn_cipher: String,
    #[serde(default)]
    pub ssl_vpn_auth: String,
    /// `udp` or `tcp`
    #[serde(default)]
    pub ssl_vpn_proto: String,
    #[serde(default)]
    pub ssl_vpn_subnet_cidr: String,
    #[serde(default)]
    pub ssl_vpn_image: String,

    // IPsec VPN (strongSwan)
    #[serde(default)]
    pub enable_ipsec_vpn: bool,
    #[serde(default)]
    pub ipsec_secret: String,
    #[serde(default)]
    pub ipsec_vpn_image: String,
    /// Connections of this gateway authenticate with pre-shared keys instead of certificates
    #[serde(default, rename = "ipsecEnablePSK")]
    pub ipsec_enable_psk: bool,
    /// Key used by PSK connections that carry none of their own
    #[serde(default, rename = "defaultPSK", skip_serializing_if = "Option::is_none")]
    pub default_psk: Option<String>,
}

/// Status of a VpnGw
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpnGwStatus {
    /// Inputs of the workload as last committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<WorkloadSnapshot>,

    /// Connections confirmed applied on every replica
    #[serde(default)]
    pub ipsec_connections: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Every input that shapes the synthesized workload, compared field by field
/// against the live spec to decide whether the child needs an update.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSnapshot {
    pub keepalived: String,
    pub workload_type: WorkloadType,
    pub cpu: String,
    pub memory: String,
    pub qos_bandwidth: String,
    pub replicas: i32,
    #[serde(default)]
    pub selector: Vec<String>,
    #[serde(default)]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub affinity: Option<Affinity>,

    pub enable_ssl_vpn: bool,
    pub ssl_vpn_secret: String,
    pub dh_secret: String,
    pub ssl_vpn_cipher: String,
    pub ssl_vpn_auth: String,
    pub ssl_vpn_proto: String,
    pub ssl_vpn_subnet_cidr: String,
    pub ssl_vpn_image: String,

    pub enable_ipsec_vpn: bool,
    pub ipsec_secret: String,
    pub ipsec_vpn_image: String,
    #[serde(rename = "ipsecEnablePSK")]
    pub ipsec_enable_psk: bool,

    // Resolved from the KeepAlived
    pub keepalived_image: String,
    pub keepalived_subnet: String,
    pub keepalived_vip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalived_nic: Option<String>,
    #[serde(rename = "keepalivedRouterID")]
    pub keepalived_router_id: u32,
}

impl WorkloadSnapshot {
    pub fn observe(spec: &VpnGwSpec, ka: &KeepAlived) -> Self {
        Self {
            keepalived: spec.keepalived.clone(),
            workload_type: spec.workload_type,
            cpu: spec.cpu.clone(),
            memory: spec.memory.clone(),
            qos_bandwidth: spec.qos_bandwidth.clone(),
            replicas: spec.replicas,
            selector: spec.selector.clone(),
            tolerations: spec.tolerations.clone(),
            affinity: spec.affinity.clone(),
            enable_ssl_vpn: spec.enable_ssl_vpn,
            ssl_vpn_secret: spec.ssl_vpn_secret.clone(),
            dh_secret: spec.dh_secret.clone(),
            ssl_vpn_cipher: spec.ssl_vpn_cipher.clone(),
            ssl_vpn_auth: spec.ssl_vpn_auth.clone(),
            ssl_vpn_proto: spec.ssl_vpn_proto.clone(),
            ssl_vpn_subnet_cidr: spec.ssl_vpn_subnet_cidr.clone(),
            ssl_vpn_image: spec.ssl_vpn_image.clone(),
            enable_ipsec_vpn: spec.enable_ipsec_vpn,
            ipsec_secret: spec.ipsec_secret.clone(),
            ipsec_vpn_image: spec.ipsec_vpn_image.clone(),
            ipsec_enable_psk: spec.ipsec_enable_psk,
            keepalived_image: ka.spec.image.clone(),
            keepalived_subnet: ka.spec.subnet.clone(),
            keepalived_vip: ka.spec.vip.clone(),
            keepalived_nic: ka.spec.nic.clone(),
            keepalived_router_id: ka.router_id(),
        }
    }
}

impl VpnGwSpec {
    /// Validate the gateway spec, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        if self.keepalived.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.keepalived",
                "keepalived is required",
                "Set spec.keepalived to the name of a KeepAlived in the same namespace.",
            ));
        }

        if self.cpu.trim().is_empty() || self.memory.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.cpu / spec.memory",
                "cpu and memory are required",
                "Set spec.cpu and spec.memory, e.g. \"1\" and \"1Gi\".",
            ));
        }

        if self.qos_bandwidth.trim().is_empty() || self.qos_bandwidth.trim() == "0" {
            errors.push(SpecValidationError::new(
                "spec.qosBandwidth",
                "qos bandwidth is required and must not be 0",
                "Set spec.qosBandwidth to the gateway bandwidth in Mbit/s.",
            ));
        }

        if self.workload_type == WorkloadType::StatefulSet && self.replicas < 1 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                "statefulset gateways need at least one replica",
                "Set spec.replicas to 1 or more.",
            ));
        }

        for entry in &self.selector {
            if parse_selector_entry(entry).is_none() {
                errors.push(SpecValidationError::new(
                    "spec.selector",
                    format!("invalid node selector entry {entry:?}"),
                    "Write node selector entries as key:value.",
                ));
            }
        }

        if !self.enable_ssl_vpn && !self.enable_ipsec_vpn {
            errors.push(SpecValidationError::new(
                "spec.enableSslVpn / spec.enableIpsecVpn",
                "either ssl vpn or ipsec vpn should be enabled",
                "Enable at least one of spec.enableSslVpn and spec.enableIpsecVpn.",
            ));
        }

        if self.enable_ssl_vpn {
            let required = [
                ("spec.sslVpnSecret", &self.ssl_vpn_secret),
                ("spec.dhSecret", &self.dh_secret),
                ("spec.sslVpnCipher", &self.ssl_vpn_cipher),
                ("spec.sslVpnProto", &self.ssl_vpn_proto),
                ("spec.sslVpnSubnetCidr", &self.ssl_vpn_subnet_cidr),
                ("spec.sslVpnImage", &self.ssl_vpn_image),
            ];
            for (field, value) in required {
                if value.trim().is_empty() {
                    errors.push(SpecValidationError::new(
                        field,
                        format!("{field} is required when ssl vpn is enabled"),
                        format!("Set {field} or disable spec.enableSslVpn."),
                    ));
                }
            }
            if !self.ssl_vpn_proto.is_empty() && !matches!(self.ssl_vpn_proto.as_str(), "udp" | "tcp")
            {
                errors.push(SpecValidationError::new(
                    "spec.sslVpnProto",
                    "ssl vpn proto should be udp or tcp",
                    "Set spec.sslVpnProto to \"udp\" or \"tcp\".",
                ));
            }
        }

        if self.enable_ipsec_vpn {
            if self.ipsec_secret.trim().is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.ipsecSecret",
                    "ipsec vpn secret is required",
                    "Set spec.ipsecSecret to the Secret holding the strongSwan certificates.",
                ));
            }
            if self.ipsec_vpn_image.trim().is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.ipsecVpnImage",
                    "ipsec vpn image is required",
                    "Set spec.ipsecVpnImage to a strongSwan container image.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Node selector built from the `key:value` entries
    pub fn node_selector(&self) -> BTreeMap<String, String> {
        self.selector
            .iter()
            .filter_map(|entry| parse_selector_entry(entry))
            .collect()
    }
}

fn parse_selector_entry(entry: &str) -> Option<(String, String)> {
    let (key, value) = entry.trim().split_once(':')?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.contains(':') {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

impl VpnGw {
    /// Connection names committed to status
    pub fn active_connections(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.ipsec_connections.as_slice())
            .unwrap_or_default()
    }
}
