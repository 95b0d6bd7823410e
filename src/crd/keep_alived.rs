use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SpecValidationError};

/// Label carrying the router-id scope of a KeepAlived
pub const SCOPE_LABEL: &str = "subnet";

/// Highest router id the VRRP protocol can carry
pub const MAX_ROUTER_ID: u32 = 255;

/// HA group providing the VIP in front of one or more gateways
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vpn-gw.kubecombo.com",
    version = "v1",
    kind = "KeepAlived",
    namespaced,
    status = "KeepAlivedStatus",
    shortname = "ka",
    printcolumn = r#"{"name":"Subnet","type":"string","jsonPath":".spec.subnet"}"#,
    printcolumn = r#"{"name":"VIP","type":"string","jsonPath":".spec.vip"}"#,
    printcolumn = r#"{"name":"RouterID","type":"integer","jsonPath":".status.routerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeepAlivedSpec {
    pub image: String,

    /// Logical switch the VIP lives in; also the router-id scope
    pub subnet: String,

    pub vip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_v6: Option<String>,

    /// Interface keepalived binds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_auth: Option<PasswordAuth>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verbatim_config: BTreeMap<String, String>,

    #[serde(default)]
    pub unicast_enabled: bool,
}

/// VRRP password stored in a Secret
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuth {
    pub secret_ref: String,
    pub secret_key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeepAlivedStatus {
    /// Assigned VRRP virtual router id, 0 while unassigned
    #[serde(default, rename = "routerID")]
    pub router_id: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl KeepAlivedSpec {
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.image",
                "keepalived image is required",
                "Set spec.image to a keepalived container image.",
            ));
        }
        if self.subnet.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.subnet",
                "keepalived subnet is required",
                "Set spec.subnet to the subnet holding the VIP.",
            ));
        }
        if self.vip.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.vip",
                "keepalived vip is required",
                "Set spec.vip to a free address in the subnet.",
            ));
        }
        if let Some(auth) = &self.password_auth {
            if auth.secret_ref.is_empty() || auth.secret_key.is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.passwordAuth",
                    "passwordAuth needs both secretRef and secretKey",
                    "Set spec.passwordAuth.secretRef and spec.passwordAuth.secretKey, or remove passwordAuth.",
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

impl KeepAlived {
    /// Router id recorded in status, 0 when unassigned
    pub fn router_id(&self) -> u32 {
        self.status.as_ref().map(|s| s.router_id).unwrap_or(0)
    }
}
