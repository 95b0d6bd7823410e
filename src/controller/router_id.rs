//! VRRP router id allocation for KeepAlived groups sharing a scope
//!
//! The choice of id is a pure function over the ids already taken in the
//! scope. Siblings are found through the scope label, so an object is
//! labelled before it is given an id. The status write is conditional on
//! the resourceVersion of the labelled object, and siblings are listed
//! fresh on every try.

use std::collections::BTreeSet;

use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::crd::{KeepAlived, KeepAlivedStatus, MAX_ROUTER_ID, SCOPE_LABEL};
use crate::error::{Error, Result};

/// Lowest id in `1..=255` not present in `assigned`
pub fn next_router_id(assigned: &BTreeSet<u32>) -> Result<u32> {
    (1..=MAX_ROUTER_ID)
        .find(|id| !assigned.contains(id))
        .ok_or_else(|| {
            Error::CapacityExhausted(format!("cannot allocate more than {MAX_ROUTER_ID} ids"))
        })
}

/// Non-zero ids held by siblings, ignoring the object being allocated for
pub fn assigned_router_ids(siblings: &[KeepAlived], exclude: &str) -> BTreeSet<u32> {
    siblings
        .iter()
        .filter(|ka| ka.name_any() != exclude)
        .map(KeepAlived::router_id)
        .filter(|id| *id != 0)
        .collect()
}

/// Label `ka` with its router id scope so siblings can list it.
/// Returns the object as stored once the label is in place.
pub async fn ensure_scope_label(api: &Api<KeepAlived>, ka: &KeepAlived) -> Result<KeepAlived> {
    if ka.labels().get(SCOPE_LABEL) == Some(&ka.spec.subnet) {
        return Ok(ka.clone());
    }

    info!(
        "Labelling keepalived {} with {}={}",
        ka.name_any(),
        SCOPE_LABEL,
        ka.spec.subnet
    );
    let patch = serde_json::json!({
        "metadata": { "labels": { SCOPE_LABEL: ka.spec.subnet } }
    });
    Ok(api
        .patch(&ka.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Return the router id of `ka`, assigning one first if it has none.
///
/// An id already in status is returned as is; allocation happens at most
/// once per KeepAlived.
#[instrument(skip(client, ka, lock), fields(name = %ka.name_any(), namespace = ka.namespace()))]
pub async fn ensure_router_id(client: &Client, ka: &KeepAlived, lock: &Mutex<()>) -> Result<u32> {
    let existing = ka.router_id();
    if existing != 0 {
        return Ok(existing);
    }

    let namespace = ka.namespace().unwrap_or_else(|| "default".to_string());
    let name = ka.name_any();
    let api: Api<KeepAlived> = Api::namespaced(client.clone(), &namespace);

    let _guard = lock.lock().await;

    // Unlabelled, the id would be invisible to the next allocation in scope
    let labelled = ensure_scope_label(&api, ka).await?;
    if labelled.router_id() != 0 {
        return Ok(labelled.router_id());
    }

    let selector = format!("{}={}", SCOPE_LABEL, ka.spec.subnet);
    let siblings = api.list(&ListParams::default().labels(&selector)).await?;
    let router_id = next_router_id(&assigned_router_ids(&siblings.items, &name))?;

    let mut updated = labelled;
    let status = updated.status.get_or_insert_with(KeepAlivedStatus::default);
    status.router_id = router_id;

    // metadata.resourceVersion is carried over from the read, making this conditional
    api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&updated)?)
        .await
        .map_err(|e| Error::from_write(e, "keepalived router id"))?;

    info!(
        "Assigned router id {} to keepalived {}/{} (scope {})",
        router_id, namespace, name, selector
    );
    Ok(router_id)
}
