use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SpecValidationError};

/// Label associating an IpsecConn (and gateway pods) with a VpnGw
pub const VPN_GW_LABEL: &str = "vpn-gw";

fn default_auth() -> String {
    AuthMode::Certificate.to_string()
}

fn default_ike_version() -> String {
    "2".to_string()
}

fn default_proposals() -> String {
    "default".to_string()
}

/// One IPsec tunnel definition, discovered by label rather than owned
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vpn-gw.kubecombo.com",
    version = "v1",
    kind = "IpsecConn",
    namespaced,
    status = "IpsecConnStatus",
    shortname = "ipsecconn",
    printcolumn = r#"{"name":"VpnGw","type":"string","jsonPath":".spec.vpnGw"}"#,
    printcolumn = r#"{"name":"Auth","type":"string","jsonPath":".spec.auth"}"#,
    printcolumn = r#"{"name":"RemotePublicIp","type":"string","jsonPath":".spec.remotePublicIp"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IpsecConnSpec {
    pub vpn_gw: String,

    /// `pubkey` or `psk`
    #[serde(default = "default_auth")]
    pub auth: String,

    /// `0` (any), `1` or `2`
    #[serde(default = "default_ike_version")]
    pub ike_version: String,

    #[serde(default = "default_proposals")]
    pub ike_proposals: String,

    #[serde(default, rename = "localCN")]
    pub local_cn: String,
    pub local_public_ip: String,
    /// Comma separated CIDRs
    pub local_private_cidrs: String,

    #[serde(default, rename = "remoteCN")]
    pub remote_cn: String,
    pub remote_public_ip: String,
    pub remote_private_cidrs: String,

    #[serde(default = "default_proposals")]
    pub esp_proposals: String,

    /// Overrides the gateway's defaultPSK
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_gateway_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_gateway_nic: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpsecConnStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// How a tunnel authenticates its peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthMode {
    /// X.509 certificates, identified by CN
    Certificate,
    PreSharedKey,
}

impl AuthMode {
    /// Subcommand of the in-pod connection script that reloads this mode
    pub fn refresh_subcommand(&self) -> &'static str {
        match self {
            AuthMode::Certificate => "refresh-x509",
            AuthMode::PreSharedKey => "refresh-psk",
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Certificate => write!(f, "pubkey"),
            AuthMode::PreSharedKey => write!(f, "psk"),
        }
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pubkey" => Ok(AuthMode::Certificate),
            "psk" => Ok(AuthMode::PreSharedKey),
            other => Err(format!("unknown auth mode {other:?}, expected pubkey or psk")),
        }
    }
}

/// A value is safe on the connection wire format when it is non-empty and
/// holds neither the record nor the field separator.
pub fn is_wire_safe(value: &str) -> bool {
    !value.is_empty() && !value.contains(':') && !value.chars().any(char::is_whitespace)
}

impl IpsecConnSpec {
    /// Checks that need nothing but the descriptor itself
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.vpn_gw.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.vpnGw",
                "vpnGw is required",
                "Set spec.vpnGw to the name of the VpnGw serving this connection.",
            ));
        }

        let auth = match self.auth.parse::<AuthMode>() {
            Ok(auth) => Some(auth),
            Err(message) => {
                errors.push(SpecValidationError::new(
                    "spec.auth",
                    message,
                    "Set spec.auth to \"pubkey\" or \"psk\".",
                ));
                None
            }
        };

        if !matches!(self.ike_version.as_str(), "0" | "1" | "2") {
            errors.push(SpecValidationError::new(
                "spec.ikeVersion",
                format!("unsupported ike version {:?}", self.ike_version),
                "Set spec.ikeVersion to 0, 1 or 2.",
            ));
        }

        let mut wire_fields = vec![
            ("spec.ikeProposals", self.ike_proposals.as_str()),
            ("spec.localPublicIp", self.local_public_ip.as_str()),
            ("spec.localPrivateCidrs", self.local_private_cidrs.as_str()),
            ("spec.remotePublicIp", self.remote_public_ip.as_str()),
            ("spec.remotePrivateCidrs", self.remote_private_cidrs.as_str()),
        ];

        match auth {
            Some(AuthMode::Certificate) => {
                wire_fields.push(("spec.localCN", self.local_cn.as_str()));
                wire_fields.push(("spec.remoteCN", self.remote_cn.as_str()));
            }
            Some(AuthMode::PreSharedKey) => {
                wire_fields.push(("spec.espProposals", self.esp_proposals.as_str()));
                if let Some(key) = &self.preshared_key {
                    wire_fields.push(("spec.presharedKey", key.as_str()));
                }
                match (&self.local_gateway_ip, &self.local_gateway_nic) {
                    (Some(ip), Some(nic)) => {
                        wire_fields.push(("spec.localGatewayIp", ip.as_str()));
                        wire_fields.push(("spec.localGatewayNic", nic.as_str()));
                    }
                    (Some(_), None) => errors.push(SpecValidationError::new(
                        "spec.localGatewayNic",
                        "localGatewayIp is set without localGatewayNic",
                        "Set spec.localGatewayNic to the interface owning spec.localGatewayIp.",
                    )),
                    (None, Some(_)) => errors.push(SpecValidationError::new(
                        "spec.localGatewayIp",
                        "localGatewayNic is set without localGatewayIp",
                        "Set spec.localGatewayIp or remove spec.localGatewayNic.",
                    )),
                    (None, None) => {}
                }
            }
            None => {}
        }

        for (field, value) in wire_fields {
            if !is_wire_safe(value) {
                errors.push(SpecValidationError::new(
                    field,
                    format!("{field} must be non-empty and free of spaces and ':'"),
                    format!("Set {field} to a single token without whitespace or ':'."),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
