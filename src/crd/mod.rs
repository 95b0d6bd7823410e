//! Custom Resource Definitions for kube-combo
//!
//! Three namespaced kinds in `vpn-gw.kubecombo.com/v1`: the gateway
//! ([`VpnGw`]), its HA group ([`KeepAlived`]) and the tunnels it
//! serves ([`IpsecConn`]).

mod ipsec_conn;
mod keep_alived;
pub mod types;
mod vpn_gw;


pub use ipsec_conn::{
    is_wire_safe, AuthMode, IpsecConn, IpsecConnSpec, IpsecConnStatus, VPN_GW_LABEL,
};
pub use keep_alived::{
    KeepAlived, KeepAlivedSpec, KeepAlivedStatus, PasswordAuth, MAX_ROUTER_ID, SCOPE_LABEL,
};
pub use types::*;
pub use vpn_gw::{VpnGw, VpnGwSpec, VpnGwStatus, WorkloadSnapshot};
