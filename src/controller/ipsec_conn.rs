//! IpsecConn reconciler
//!
//! Connections are not owned by their gateway. They are found through the
//! `vpn-gw` label, which this reconciler keeps in line with `spec.vpnGw`.

use std::sync::Arc;
use std::time::Instant;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use crate::crd::{IpsecConn, VPN_GW_LABEL};
use crate::error::Result;

use super::reconciler::{namespace_of, observe_outcome, record_failure, record_ready, ControllerState};
use super::sync_state::SyncState;

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub(crate) async fn reconcile(obj: Arc<IpsecConn>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let api: Api<IpsecConn> = Api::namespaced(ctx.client.clone(), &namespace_of(&*obj));

    let result = apply_ipsec_conn(&api, &obj).await;
    observe_outcome("ipsecconn", started, &result);

    if let Err(e) = &result {
        if SyncState::from_error(e) == SyncState::TerminalError {
            let current = obj.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
            record_failure(&api, &*obj, current, e).await;
        }
    }

    result.map(|()| SyncState::Success.action(ctx.config.retry_delay))
}

async fn apply_ipsec_conn(api: &Api<IpsecConn>, conn: &IpsecConn) -> Result<()> {
    conn.spec.validate()?;

    let conn = ensure_gateway_label(api, conn).await?;

    let current = conn.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
    record_ready(
        api,
        &conn,
        current,
        "Valid",
        &format!("{} connection for vpn gw {}", conn.spec.auth, conn.spec.vpn_gw),
    )
    .await
}

/// Whether the discovery label already points at `spec.vpnGw`
pub(crate) fn has_gateway_label(conn: &IpsecConn) -> bool {
    conn.labels().get(VPN_GW_LABEL) == Some(&conn.spec.vpn_gw)
}

async fn ensure_gateway_label(api: &Api<IpsecConn>, conn: &IpsecConn) -> Result<IpsecConn> {
    if has_gateway_label(conn) {
        return Ok(conn.clone());
    }

    info!(
        "Labelling ipsec conn {} with {}={}",
        conn.name_any(),
        VPN_GW_LABEL,
        conn.spec.vpn_gw
    );
    let patch = serde_json::json!({
        "metadata": { "labels": { VPN_GW_LABEL: conn.spec.vpn_gw } }
    });
    Ok(api
        .patch(&conn.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}
