//! kube-combo: Kubernetes operator for SSL and IPsec VPN gateways
//!
//! A `VpnGw` becomes a StatefulSet (or a per-node DaemonSet) running
//! OpenVPN and/or strongSwan next to keepalived. A `KeepAlived` supplies
//! the VIP and a VRRP router id unique within its subnet. `IpsecConn`
//! objects are pushed into the running strongSwan containers without a
//! restart.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::OperatorConfig;
pub use crate::error::{Error, Result};
