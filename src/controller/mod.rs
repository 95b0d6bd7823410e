//! Controllers for VpnGw, KeepAlived and IpsecConn
//!
//! The gateway reconciler drives the router id allocator, the workload
//! builders and the live connection refresh. KeepAlived and IpsecConn get
//! small reconcilers of their own for validation and labelling.

pub mod conditions;
pub mod connections;
mod ipsec_conn;
mod keepalived;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod refresh;
pub mod resources;
pub mod router_id;
pub mod sync_state;
#[cfg(test)]
mod test_support;

pub use connections::{aggregate, discover_connections, Connection, ConnectionTable, GatewayContext};
pub use reconciler::{run_controller, scoped_api, ControllerState};
pub use refresh::{refresh_connections, ExecOutput, KubePodExecutor, PodExecutor};
pub use resources::{build_workload, ensure_workload, is_changed, DesiredWorkload};
pub use router_id::{ensure_router_id, ensure_scope_label, next_router_id};
pub use sync_state::SyncState;
