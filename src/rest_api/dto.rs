//! Response bodies of the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{VpnGwStatus, WorkloadType};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnGwSummary {
    pub name: String,
    pub namespace: String,
    pub keepalived: String,
    pub workload_type: WorkloadType,
    pub enable_ssl_vpn: bool,
    pub enable_ipsec_vpn: bool,
    pub ready: bool,
    pub ipsec_connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VpnGwListResponse {
    pub items: Vec<VpnGwSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnGwDetailResponse {
    pub name: String,
    pub namespace: String,
    pub status: VpnGwStatus,
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
