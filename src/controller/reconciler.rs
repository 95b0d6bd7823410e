//! Gateway reconciler and controller wiring
//!
//! Implements the controller pattern using kube-rs runtime. Three
//! controllers run side by side: VpnGw, KeepAlived and IpsecConn.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    AuthMode, Condition, IpsecConn, KeepAlived, KeepAlivedStatus, VpnGw, VpnGwStatus,
    WorkloadSnapshot, VPN_GW_LABEL,
};
use crate::error::{Error, Result};

use super::conditions::{mark_failed, mark_ready};
use super::connections::{aggregate, discover_connections, GatewayContext};
use super::refresh::{list_gateway_pods, refresh_connections, KubePodExecutor, PodExecutor};
use super::resources::ensure_workload;
use super::router_id::ensure_router_id;
use super::sync_state::SyncState;
use super::{ipsec_conn, keepalived};

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub executor: Arc<dyn PodExecutor>,
    /// Serializes router id allocation within this process
    pub allocation_lock: Mutex<()>,
    /// Set while this replica holds the leader lease, or always without election
    pub is_leader: Arc<AtomicBool>,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            executor: Arc::new(KubePodExecutor::new(client.clone())),
            client,
            config,
            allocation_lock: Mutex::new(()),
            is_leader: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn PodExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_leader_flag(mut self, is_leader: Arc<AtomicBool>) -> Self {
        self.is_leader = is_leader;
        self
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }
}

/// Api over one namespace, or over all of them when `namespace` is unset
pub fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the controllers
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.config.watch_namespace.clone();
    let ns = namespace.as_deref();

    let gateways: Api<VpnGw> = scoped_api(&client, ns);
    let keepaliveds: Api<KeepAlived> = scoped_api(&client, ns);
    let connections: Api<IpsecConn> = scoped_api(&client, ns);

    info!("Starting kube-combo controllers");

    // Verify CRDs exist
    let probe = ListParams::default().limit(1);
    let installed = gateways.list(&probe).await.is_ok()
        && keepaliveds.list(&probe).await.is_ok()
        && connections.list(&probe).await.is_ok();
    if !installed {
        error!("kube-combo CRDs not found. Install them first with `crdgen | kubectl apply -f -`");
        return Err(Error::ConfigError(
            "VpnGw, KeepAlived or IpsecConn CRD not installed".to_string(),
        ));
    }

    let controller_config = controller::Config::default().concurrency(state.config.workers);

    let gateway_controller = Controller::new(gateways, Config::default())
        .owns::<StatefulSet>(scoped_api(&client, ns), Config::default())
        .owns::<DaemonSet>(scoped_api(&client, ns), Config::default())
        // A connection edit refreshes the gateway it is labelled for
        .watches(
            connections.clone(),
            Config::default().labels(VPN_GW_LABEL),
            |conn: IpsecConn| {
                let namespace = conn.namespace()?;
                conn.labels()
                    .get(VPN_GW_LABEL)
                    .map(|gw| ObjectRef::<VpnGw>::new(gw).within(&namespace))
            },
        )
        .with_config(controller_config.clone())
        .shutdown_on_signal()
        .run(reconcile, error_policy::<VpnGw>, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled vpn gw {}", obj.0),
                Err(e) => debug!("Vpn gw reconcile error: {}", e),
            }
        });

    let keepalived_controller = Controller::new(keepaliveds, Config::default())
        .with_config(controller_config.clone())
        .shutdown_on_signal()
        .run(keepalived::reconcile, error_policy::<KeepAlived>, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled keepalived {}", obj.0),
                Err(e) => debug!("Keepalived reconcile error: {}", e),
            }
        });

    let connection_controller = Controller::new(connections, Config::default())
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(ipsec_conn::reconcile, error_policy::<IpsecConn>, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled ipsec conn {}", obj.0),
                Err(e) => debug!("Ipsec conn reconcile error: {}", e),
            }
        });

    tokio::join!(gateway_controller, keepalived_controller, connection_controller);
    info!("kube-combo controllers stopped");

    Ok(())
}

/// Reconcile a VpnGw
///
/// This function is called whenever:
/// - A VpnGw is created or updated
/// - Its StatefulSet or DaemonSet changes
/// - An IpsecConn labelled for it changes
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<VpnGw>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    info!("Reconciling VpnGw {}", obj.name_any());

    let result = apply_vpn_gw(&ctx, &obj).await;
    observe_outcome("vpngw", started, &result);

    if let Err(e) = &result {
        if SyncState::from_error(e) == SyncState::TerminalError {
            let api: Api<VpnGw> = Api::namespaced(ctx.client.clone(), &namespace_of(&*obj));
            let current = obj.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
            record_failure(&api, &*obj, current, e).await;
        }
    }

    result.map(|()| SyncState::Success.action(ctx.config.retry_delay))
}

/// One pass over a gateway: workload first, then the connection table,
/// then a single status commit. Any failing step leaves status as it was.
pub(crate) async fn apply_vpn_gw(ctx: &ControllerState, gw: &VpnGw) -> Result<()> {
    gw.spec.validate()?;

    let namespace = namespace_of(gw);
    let name = gw.name_any();

    let keepaliveds: Api<KeepAlived> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut ka = keepaliveds
        .get_opt(&gw.spec.keepalived)
        .await?
        .ok_or_else(|| {
            Error::TransientInfraError(format!(
                "keepalived {}/{} not found",
                namespace, gw.spec.keepalived
            ))
        })?;
    ka.spec.validate()?;

    let router_id = ensure_router_id(&ctx.client, &ka, &ctx.allocation_lock).await?;
    ka.status.get_or_insert_with(KeepAlivedStatus::default).router_id = router_id;

    ensure_workload(&ctx.client, gw, &ka, &ctx.config).await?;

    let connections = if gw.spec.enable_ipsec_vpn {
        let descriptors = discover_connections(&ctx.client, &namespace, &name).await?;
        let gateway = GatewayContext {
            name: &name,
            mode: gateway_auth_mode(gw),
            local_vip: &ka.spec.vip,
            default_psk: gw.spec.default_psk.as_deref(),
        };
        let table = aggregate(&descriptors, &gateway)?;
        let pods = list_gateway_pods(&ctx.client, &namespace, &name).await?;
        refresh_connections(
            ctx.executor.as_ref(),
            &name,
            &pods,
            &table,
            ctx.config.exec_timeout,
        )
        .await?;
        table.names()
    } else {
        Vec::new()
    };

    #[cfg(feature = "metrics")]
    super::metrics::set_ipsec_connections(&namespace, &name, connections.len());

    commit_status(&ctx.client, gw, build_status(gw, &ka, connections)).await
}

/// Auth mode every connection of the gateway must use
pub(crate) fn gateway_auth_mode(gw: &VpnGw) -> AuthMode {
    if gw.spec.ipsec_enable_psk {
        AuthMode::PreSharedKey
    } else {
        AuthMode::Certificate
    }
}

/// Status after a fully successful pass
pub(crate) fn build_status(gw: &VpnGw, ka: &KeepAlived, connections: Vec<String>) -> VpnGwStatus {
    let mut conditions = gw
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let message = if connections.is_empty() {
        "Gateway workload is up to date".to_string()
    } else {
        format!("Gateway serves {} ipsec connections", connections.len())
    };
    mark_ready(&mut conditions, "Reconciled", &message, gw.metadata.generation);

    VpnGwStatus {
        applied: Some(WorkloadSnapshot::observe(&gw.spec, ka)),
        ipsec_connections: connections,
        conditions,
        observed_generation: gw.metadata.generation,
    }
}

/// Write `status` conditionally on the resourceVersion that was read
async fn commit_status(client: &Client, gw: &VpnGw, status: VpnGwStatus) -> Result<()> {
    if gw.status.as_ref() == Some(&status) {
        debug!("Status of vpn gw {} is unchanged", gw.name_any());
        return Ok(());
    }

    let api: Api<VpnGw> = Api::namespaced(client.clone(), &namespace_of(gw));
    let mut updated = gw.clone();
    updated.status = Some(status);

    api.replace_status(&gw.name_any(), &PostParams::default(), serde_json::to_vec(&updated)?)
        .await
        .map_err(|e| Error::from_write(e, "vpn gw status"))?;
    Ok(())
}

pub(crate) fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.meta()
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

/// Merge `Ready=False` (and `Degraded` for terminal errors) into the
/// object's conditions. Nothing else in status is touched.
pub(crate) async fn record_failure<K>(api: &Api<K>, obj: &K, current: &[Condition], error: &Error)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let mut conditions = current.to_vec();
    mark_failed(&mut conditions, error, obj.meta().generation);
    if conditions.as_slice() == current {
        return;
    }

    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    if let Err(e) = api
        .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!("Failed to record failure condition on {}: {}", obj.name_any(), e);
    }
}

/// Merge `Ready=True` into the object's conditions when it is not already set
pub(crate) async fn record_ready<K>(
    api: &Api<K>,
    obj: &K,
    current: &[Condition],
    reason: &str,
    message: &str,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let mut conditions = current.to_vec();
    mark_ready(&mut conditions, reason, message, obj.meta().generation);
    if conditions.as_slice() == current {
        return Ok(());
    }

    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    api.patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub(crate) fn observe_outcome<T>(controller: &str, started: Instant, result: &Result<T>) {
    #[cfg(feature = "metrics")]
    {
        super::metrics::inc_reconcile(controller);
        super::metrics::observe_reconcile_duration_seconds(
            controller,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = result {
            super::metrics::inc_reconcile_error(controller, e.kind());
        }
    }
}

/// Error policy shared by all controllers
pub(crate) fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<ControllerState>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let state = SyncState::from_error(error);
    match state {
        SyncState::RetryableError => warn!(
            "Reconciling {} {} failed, retrying in {:?}: {}",
            K::kind(&()),
            obj.name_any(),
            ctx.config.retry_delay,
            error
        ),
        _ => error!(
            "Reconciling {} {} failed until its spec changes: {}",
            K::kind(&()),
            obj.name_any(),
            error
        ),
    }
    state.action(ctx.config.retry_delay)
}
