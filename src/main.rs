use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube_combo::crd::{IpsecConn, KeepAlived, VpnGw};
use kube_combo::telemetry::{LogFormat, TelemetryConfig};
use kube_combo::{controller, Error, OperatorConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the gateways, HA groups and connections in the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    lease_namespace: String,

    /// Kubelet static pod directory used by the static topology
    #[arg(long, env = "K8S_MANIFESTS_PATH", default_value = kube_combo::config::DEFAULT_K8S_MANIFESTS_PATH)]
    k8s_manifests_path: String,

    /// Deadline for one connection refresh exec
    #[arg(long, env = "EXEC_TIMEOUT_SECS", default_value_t = 30)]
    exec_timeout_secs: u64,

    /// Requeue delay after a retryable failure
    #[arg(long, env = "RETRY_DELAY_SECS", default_value_t = 3)]
    retry_delay_secs: u64,

    /// Wait after creating or updating a gateway workload
    #[arg(long, env = "SETTLE_DELAY_SECS", default_value_t = 5)]
    settle_delay_secs: u64,

    /// Concurrent reconciliations per controller
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: u16,

    /// Address of the health, metrics and REST endpoints
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Export traces to OTEL_EXPORTER_OTLP_ENDPOINT
    #[arg(long, env = "ENABLE_OTEL")]
    enable_otel: bool,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            watch_namespace: self.namespace.clone(),
            k8s_manifests_path: self.k8s_manifests_path.clone(),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            workers: self.workers,
        }
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to inspect; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("kube-combo operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    let ns = args.namespace.as_deref();

    let gateways = controller::scoped_api::<VpnGw>(&client, ns)
        .list(&ListParams::default())
        .await?;
    let keepaliveds = controller::scoped_api::<KeepAlived>(&client, ns)
        .list(&ListParams::default())
        .await?;
    let connections = controller::scoped_api::<IpsecConn>(&client, ns)
        .list(&ListParams::default())
        .await?;

    println!("VPN gateways: {}", gateways.items.len());
    for gw in &gateways.items {
        println!(
            "  {}/{}: {} connections",
            gw.metadata.namespace.as_deref().unwrap_or("default"),
            gw.metadata.name.as_deref().unwrap_or_default(),
            gw.active_connections().len()
        );
    }
    println!("KeepAlived groups: {}", keepaliveds.items.len());
    println!("IPsec connections: {}", connections.items.len());
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let telemetry = TelemetryConfig {
        log_format: args.log_format,
        otlp_endpoint: if args.enable_otel {
            TelemetryConfig::default().otlp_endpoint
        } else {
            None
        },
        ..Default::default()
    };
    if args.enable_otel && telemetry.otlp_endpoint.is_none() {
        eprintln!("--enable-otel is set but OTEL_EXPORTER_OTLP_ENDPOINT is not; traces stay local");
    }
    kube_combo::telemetry::init_telemetry(telemetry)
        .map_err(|e| Error::ConfigError(e.to_string()))?;

    info!(
        "Starting kube-combo operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let is_leader = Arc::new(AtomicBool::new(!args.leader_elect));
    let state = Arc::new(
        controller::ControllerState::new(client.clone(), args.operator_config())
            .with_leader_flag(Arc::clone(&is_leader)),
    );

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.http_addr;
        tokio::spawn(async move {
            if let Err(e) = kube_combo::rest_api::run_server(api_state, addr).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    if args.leader_elect {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let lease_client = client.clone();
        let lease_ns = args.lease_namespace.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &holder_identity, is_leader_bg).await;
        });

        while !is_leader.load(Ordering::Relaxed) {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    let result = tokio::select! {
        result = controller::run_controller(state) => result,
        _ = leadership_lost(Arc::clone(&is_leader)) => {
            Err(Error::ConfigError(format!("lost leadership of lease {LEASE_NAME}")))
        }
    };

    // Flush any remaining traces
    kube_combo::telemetry::shutdown_telemetry();

    result
}

/// Resolves once the leader flag drops
async fn leadership_lost(is_leader: Arc<AtomicBool>) {
    while is_leader.load(Ordering::Relaxed) {
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

const LEASE_NAME: &str = "kube-combo-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, identity);
        return Ok(true);
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!(
        "Lease held by {:?} has expired, taking over",
        current_holder
    );
    // resourceVersion makes the takeover conditional; a racing candidate gets a 409
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": existing.metadata.resource_version },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
