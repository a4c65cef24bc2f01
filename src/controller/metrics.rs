//! Prometheus metrics for the VM export controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `vm_export_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `vm_export_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `vm_export_exporter_pod_transitions_total` (counter): exporter pod lifecycle actions labeled by action.
//! - `vm_export_status_updates_total` (counter): status writes labeled by controller and phase.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "vmexport"
    pub controller: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "kube", "source", "certificate"
    pub kind: String,
}

/// Labels for exporter pod lifecycle actions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PodTransitionLabels {
    /// "created", "paused" or "completed"
    pub action: String,
}

/// Labels for status writes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusUpdateLabels {
    pub controller: String,
    /// Phase written, e.g. "Pending", "Ready" or "Terminated"
    pub phase: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static EXPORTER_POD_TRANSITIONS_TOTAL: Lazy<
    Family<PodTransitionLabels, Counter<u64, AtomicU64>>,
> = Lazy::new(Family::default);

pub static STATUS_UPDATES_TOTAL: Lazy<Family<StatusUpdateLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global registry scraped by the `/metrics` handler
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "vm_export_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    // Counters get the `_total` suffix appended on encoding.
    registry.register(
        "vm_export_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "vm_export_exporter_pod_transitions",
        "Exporter pod lifecycle actions taken by the controller",
        EXPORTER_POD_TRANSITIONS_TOTAL.clone(),
    );
    registry.register(
        "vm_export_status_updates",
        "Status writes issued for VirtualMachineExports",
        STATUS_UPDATES_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            controller: controller.to_string(),
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_exporter_pod_transition(action: &str) {
    EXPORTER_POD_TRANSITIONS_TOTAL
        .get_or_create(&PodTransitionLabels {
            action: action.to_string(),
        })
        .inc();
}

pub fn inc_status_update(controller: &str, phase: &str) {
    STATUS_UPDATES_TOTAL
        .get_or_create(&StatusUpdateLabels {
            controller: controller.to_string(),
            phase: phase.to_string(),
        })
        .inc();
}
