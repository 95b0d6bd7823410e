//! REST API module
//!
//! Serves liveness, readiness, Prometheus metrics and a read-only view of
//! the VpnGws.

mod dto;
mod handlers;
mod server;

pub use dto::{ErrorResponse, HealthResponse, VpnGwDetailResponse, VpnGwListResponse, VpnGwSummary};
pub use server::{router, run_server};
