//! Aggregation of the IpsecConn descriptors of a gateway into a connection table
//!
//! The table travels to the gateway pods as a flat string: records are
//! separated by `:`, fields inside a record by a single space.
//!
//! Certificate record (10 fields):
//! `name auth ikeVersion ikeProposals localCN localPublicIp localPrivateCidrs remoteCN remotePublicIp remotePrivateCidrs`
//!
//! Pre-shared-key record (11 or 13 fields):
//! `name auth ikeVersion ikeProposals localVip localPublicIp localPrivateCidrs remotePublicIp remotePrivateCidrs presharedKey espProposals [localGatewayIp localGatewayNic]`

use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{instrument, warn};

use crate::crd::{
    format_validation_errors, is_wire_safe, AuthMode, IpsecConn, SpecValidationError,
    VPN_GW_LABEL,
};
use crate::error::{Error, Result};

/// In-pod script reloading the strongSwan connections
pub const CONNECTION_SCRIPT: &str = "/connection.sh";

const RECORD_SEPARATOR: char = ':';
const FIELD_SEPARATOR: char = ' ';

/// What a descriptor is checked against besides its own fields
#[derive(Clone, Copy, Debug)]
pub struct GatewayContext<'a> {
    pub name: &'a str,
    pub mode: AuthMode,
    /// KeepAlived VIP, the local address of PSK tunnels
    pub local_vip: &'a str,
    pub default_psk: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateConnection {
    pub name: String,
    pub ike_version: String,
    pub ike_proposals: String,
    pub local_cn: String,
    pub local_public_ip: String,
    pub local_private_cidrs: String,
    pub remote_cn: String,
    pub remote_public_ip: String,
    pub remote_private_cidrs: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalGateway {
    pub ip: String,
    pub nic: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PskConnection {
    pub name: String,
    pub ike_version: String,
    pub ike_proposals: String,
    pub local_vip: String,
    pub local_public_ip: String,
    pub local_private_cidrs: String,
    pub remote_public_ip: String,
    pub remote_private_cidrs: String,
    pub preshared_key: String,
    pub esp_proposals: String,
    pub local_gateway: Option<LocalGateway>,
}

/// A validated tunnel, ready for the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Connection {
    Certificate(CertificateConnection),
    PreSharedKey(PskConnection),
}

impl Connection {
    /// Build a connection from its descriptor, reporting every problem found
    pub fn from_descriptor(
        conn: &IpsecConn,
        gateway: &GatewayContext<'_>,
    ) -> std::result::Result<Self, Vec<SpecValidationError>> {
        let spec = &conn.spec;
        let mut errors = spec.validate().err().unwrap_or_default();

        if !spec.vpn_gw.is_empty() && spec.vpn_gw != gateway.name {
            errors.push(SpecValidationError::new(
                "spec.vpnGw",
                format!(
                    "connection names vpn gw {:?} but is labeled for {:?}",
                    spec.vpn_gw, gateway.name
                ),
                format!("Set spec.vpnGw and the {VPN_GW_LABEL} label to the same gateway."),
            ));
        }

        if let Ok(auth) = spec.auth.parse::<AuthMode>() {
            if auth != gateway.mode {
                errors.push(SpecValidationError::new(
                    "spec.auth",
                    format!(
                        "connection uses {auth} but gateway {} runs {}",
                        gateway.name, gateway.mode
                    ),
                    "Match spec.auth to the gateway's ipsecEnablePSK setting.",
                ));
            }
        }

        let preshared_key = spec
            .preshared_key
            .as_deref()
            .or(gateway.default_psk)
            .unwrap_or_default();
        if gateway.mode == AuthMode::PreSharedKey {
            if !is_wire_safe(preshared_key) {
                errors.push(SpecValidationError::new(
                    "spec.presharedKey",
                    "no usable pre-shared key for this connection",
                    "Set spec.presharedKey or the gateway's defaultPSK to a key without spaces or ':'.",
                ));
            }
            if !is_wire_safe(gateway.local_vip) {
                errors.push(SpecValidationError::new(
                    "keepalived.spec.vip",
                    "the gateway's keepalived vip cannot be used as local address",
                    "Set a single IPv4 vip on the gateway's keepalived.",
                ));
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let name = conn.name_any();
        Ok(match gateway.mode {
            AuthMode::Certificate => Connection::Certificate(CertificateConnection {
                name,
                ike_version: spec.ike_version.clone(),
                ike_proposals: spec.ike_proposals.clone(),
                local_cn: spec.local_cn.clone(),
                local_public_ip: spec.local_public_ip.clone(),
                local_private_cidrs: spec.local_private_cidrs.clone(),
                remote_cn: spec.remote_cn.clone(),
                remote_public_ip: spec.remote_public_ip.clone(),
                remote_private_cidrs: spec.remote_private_cidrs.clone(),
            }),
            AuthMode::PreSharedKey => Connection::PreSharedKey(PskConnection {
                name,
                ike_version: spec.ike_version.clone(),
                ike_proposals: spec.ike_proposals.clone(),
                local_vip: gateway.local_vip.to_string(),
                local_public_ip: spec.local_public_ip.clone(),
                local_private_cidrs: spec.local_private_cidrs.clone(),
                remote_public_ip: spec.remote_public_ip.clone(),
                remote_private_cidrs: spec.remote_private_cidrs.clone(),
                preshared_key: preshared_key.to_string(),
                esp_proposals: spec.esp_proposals.clone(),
                local_gateway: match (&spec.local_gateway_ip, &spec.local_gateway_nic) {
                    (Some(ip), Some(nic)) => Some(LocalGateway {
                        ip: ip.clone(),
                        nic: nic.clone(),
                    }),
                    _ => None,
                },
            }),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Connection::Certificate(c) => &c.name,
            Connection::PreSharedKey(c) => &c.name,
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Connection::Certificate(_) => AuthMode::Certificate,
            Connection::PreSharedKey(_) => AuthMode::PreSharedKey,
        }
    }

    fn fields(&self) -> Vec<String> {
        let auth = self.auth_mode().to_string();
        match self {
            Connection::Certificate(c) => vec![
                c.name.clone(),
                auth,
                c.ike_version.clone(),
                c.ike_proposals.clone(),
                c.local_cn.clone(),
                c.local_public_ip.clone(),
                c.local_private_cidrs.clone(),
                c.remote_cn.clone(),
                c.remote_public_ip.clone(),
                c.remote_private_cidrs.clone(),
            ],
            Connection::PreSharedKey(c) => {
                let mut fields = vec![
                    c.name.clone(),
                    auth,
                    c.ike_version.clone(),
                    c.ike_proposals.clone(),
                    c.local_vip.clone(),
                    c.local_public_ip.clone(),
                    c.local_private_cidrs.clone(),
                    c.remote_public_ip.clone(),
                    c.remote_private_cidrs.clone(),
                    c.preshared_key.clone(),
                    c.esp_proposals.clone(),
                ];
                if let Some(gw) = &c.local_gateway {
                    fields.push(gw.ip.clone());
                    fields.push(gw.nic.clone());
                }
                fields
            }
        }
    }

    /// One wire record
    pub fn encode(&self) -> String {
        self.fields().join(&FIELD_SEPARATOR.to_string())
    }

    /// Parse one wire record
    pub fn decode(record: &str) -> Result<Self> {
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
        if fields.iter().any(|f| f.is_empty()) {
            return Err(malformed(record, "empty field"));
        }
        let auth = fields
            .get(1)
            .ok_or_else(|| malformed(record, "missing auth field"))?
            .parse::<AuthMode>()
            .map_err(|e| malformed(record, &e))?;
        let owned = |i: usize| fields[i].to_string();

        match (auth, fields.len()) {
            (AuthMode::Certificate, 10) => Ok(Connection::Certificate(CertificateConnection {
                name: owned(0),
                ike_version: owned(2),
                ike_proposals: owned(3),
                local_cn: owned(4),
                local_public_ip: owned(5),
                local_private_cidrs: owned(6),
                remote_cn: owned(7),
                remote_public_ip: owned(8),
                remote_private_cidrs: owned(9),
            })),
            (AuthMode::PreSharedKey, 11 | 13) => Ok(Connection::PreSharedKey(PskConnection {
                name: owned(0),
                ike_version: owned(2),
                ike_proposals: owned(3),
                local_vip: owned(4),
                local_public_ip: owned(5),
                local_private_cidrs: owned(6),
                remote_public_ip: owned(7),
                remote_private_cidrs: owned(8),
                preshared_key: owned(9),
                esp_proposals: owned(10),
                local_gateway: (fields.len() == 13).then(|| LocalGateway {
                    ip: owned(11),
                    nic: owned(12),
                }),
            })),
            (auth, n) => Err(malformed(
                record,
                &format!("{auth} record with {n} fields"),
            )),
        }
    }
}

fn malformed(record: &str, why: &str) -> Error {
    Error::ValidationError(format!("malformed connection record {record:?}: {why}"))
}

/// Every connection of one gateway, all in the gateway's auth mode
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTable {
    mode: AuthMode,
    connections: Vec<Connection>,
}

impl ConnectionTable {
    /// Build a table; connections are ordered by name
    pub fn new(mode: AuthMode, mut connections: Vec<Connection>) -> Result<Self> {
        if connections.is_empty() {
            return Err(Error::ValidationError(
                "a connection table needs at least one connection".to_string(),
            ));
        }
        if let Some(odd) = connections.iter().find(|c| c.auth_mode() != mode) {
            return Err(Error::ValidationError(format!(
                "connection {} uses {} in a {} table",
                odd.name(),
                odd.auth_mode(),
                mode
            )));
        }
        connections.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(Self { mode, connections })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn names(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn encode(&self) -> String {
        self.connections
            .iter()
            .map(Connection::encode)
            .collect::<Vec<_>>()
            .join(&RECORD_SEPARATOR.to_string())
    }

    pub fn parse(table: &str) -> Result<Self> {
        let connections = table
            .split(RECORD_SEPARATOR)
            .map(Connection::decode)
            .collect::<Result<Vec<_>>>()?;
        let mode = connections
            .first()
            .map(Connection::auth_mode)
            .ok_or_else(|| Error::ValidationError("empty connection table".to_string()))?;
        Self::new(mode, connections)
    }

    /// argv of the in-pod refresh; the table is passed as one argument
    pub fn refresh_command(&self) -> Vec<String> {
        vec![
            CONNECTION_SCRIPT.to_string(),
            self.mode.refresh_subcommand().to_string(),
            self.encode(),
        ]
    }
}

/// Validate all descriptors of a gateway and build its table.
///
/// One bad descriptor fails the whole batch; every problem is logged first.
pub fn aggregate(conns: &[IpsecConn], gateway: &GatewayContext<'_>) -> Result<ConnectionTable> {
    if conns.is_empty() {
        return Err(Error::TransientInfraError(format!(
            "no ipsec connections labeled {}={} yet",
            VPN_GW_LABEL, gateway.name
        )));
    }

    let mut connections = Vec::with_capacity(conns.len());
    let mut failures = Vec::new();
    for conn in conns {
        match Connection::from_descriptor(conn, gateway) {
            Ok(connection) => connections.push(connection),
            Err(errors) => {
                let message = format_validation_errors(&errors);
                warn!(
                    "Invalid ipsec connection {} for vpn gw {}: {}",
                    conn.name_any(),
                    gateway.name,
                    message
                );
                failures.push(format!("{}: {}", conn.name_any(), message));
            }
        }
    }

    if !failures.is_empty() {
        return Err(Error::ValidationError(format!(
            "{} of {} ipsec connections are invalid: {}",
            failures.len(),
            conns.len(),
            failures.join(" | ")
        )));
    }

    ConnectionTable::new(gateway.mode, connections)
}

/// List the descriptors labeled for a gateway
#[instrument(skip(client))]
pub async fn discover_connections(
    client: &Client,
    namespace: &str,
    gateway: &str,
) -> Result<Vec<IpsecConn>> {
    let api: Api<IpsecConn> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{VPN_GW_LABEL}={gateway}");
    let list = api.list(&ListParams::default().labels(&selector)).await?;
    Ok(list.items)
}
