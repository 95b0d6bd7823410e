//! Prometheus metrics for the kube-combo operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `kube_combo_reconcile_total` (counter): reconciliations labeled by controller.
//! - `kube_combo_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `kube_combo_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `kube_combo_exec_total` (counter): connection refresh execs labeled by result.
//! - `kube_combo_ipsec_connections` (gauge): connections applied per gateway.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "vpngw"
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "validation", "transient"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecLabels {
    /// "success" or "failure"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GatewayLabels {
    pub namespace: String,
    pub name: String,
}

pub static RECONCILE_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets; a reconcile includes the settle delay
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static EXEC_TOTAL: Lazy<Family<ExecLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static IPSEC_CONNECTIONS: Lazy<Family<GatewayLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // Counters get their `_total` suffix from the encoder
    registry.register(
        "kube_combo_reconcile",
        "Total number of reconciliations",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "kube_combo_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "kube_combo_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "kube_combo_exec",
        "Connection refresh commands run in gateway pods",
        EXEC_TOTAL.clone(),
    );
    registry.register(
        "kube_combo_ipsec_connections",
        "IPsec connections applied on every replica of a gateway",
        IPSEC_CONNECTIONS.clone(),
    );

    registry
});

pub fn inc_reconcile(controller: &str) {
    RECONCILE_TOTAL
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .inc();
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            controller: controller.to_string(),
            kind: kind.to_string(),
        })
        .inc();
}

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .observe(seconds);
}

pub fn inc_exec(result: &str) {
    EXEC_TOTAL
        .get_or_create(&ExecLabels {
            result: result.to_string(),
        })
        .inc();
}

pub fn set_ipsec_connections(namespace: &str, name: &str, count: usize) {
    IPSEC_CONNECTIONS
        .get_or_create(&GatewayLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
        .set(count as i64);
}
