//! KeepAlived reconciler: validation, scope label and router id

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::instrument;

use crate::crd::{KeepAlived, PasswordAuth};
use crate::error::{Error, Result};

use super::reconciler::{namespace_of, observe_outcome, record_failure, record_ready, ControllerState};
use super::router_id::{ensure_router_id, ensure_scope_label};
use super::sync_state::SyncState;

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub(crate) async fn reconcile(obj: Arc<KeepAlived>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let api: Api<KeepAlived> = Api::namespaced(ctx.client.clone(), &namespace_of(&*obj));

    let result = apply_keepalived(&ctx, &api, &obj).await;
    observe_outcome("keepalived", started, &result);

    if let Err(e) = &result {
        if SyncState::from_error(e) == SyncState::TerminalError {
            let current = obj.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
            record_failure(&api, &*obj, current, e).await;
        }
    }

    result.map(|()| SyncState::Success.action(ctx.config.retry_delay))
}

async fn apply_keepalived(ctx: &ControllerState, api: &Api<KeepAlived>, ka: &KeepAlived) -> Result<()> {
    ka.spec.validate()?;

    if let Some(auth) = &ka.spec.password_auth {
        check_password_secret(&ctx.client, &namespace_of(ka), auth).await?;
    }

    let ka = ensure_scope_label(api, ka).await?;
    let router_id = ensure_router_id(&ctx.client, &ka, &ctx.allocation_lock).await?;

    let current = ka.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
    record_ready(
        api,
        &ka,
        current,
        "RouterIdAssigned",
        &format!("router id {router_id} in subnet {}", ka.spec.subnet),
    )
    .await
}

/// The VRRP password must be present before any gateway starts keepalived
async fn check_password_secret(client: &Client, namespace: &str, auth: &PasswordAuth) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get_opt(&auth.secret_ref).await?.ok_or_else(|| {
        Error::TransientInfraError(format!(
            "password secret {namespace}/{} not found",
            auth.secret_ref
        ))
    })?;

    if !has_key(&secret, &auth.secret_key) {
        return Err(Error::ValidationError(format!(
            "password secret {namespace}/{} has no key {}",
            auth.secret_ref, auth.secret_key
        )));
    }
    Ok(())
}

/// stringData is write-only; a stored Secret carries every key in data
fn has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
}
