use std::time::Duration;

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};

use crate::{controller::ResourceKind, utils::metric_name};

const SERVICE_CATALOG_CONTROLLER: &str = "service_catalog_controller";

/// Reconcile metrics, exported by whatever meter provider the embedding binary installs.
pub(crate) struct ControllerMetrics {
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    dropped_keys: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl ControllerMetrics {
    pub(crate) fn new() -> Self {
        let meter: Meter = global::meter(SERVICE_CATALOG_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconcile invocations")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocations which returned an error")
            .build();
        let dropped_keys = meter
            .u64_counter(metric_name("dropped_keys"))
            .with_description("Count of keys dropped after exceeding the maximum number of retries")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            reconcile_count,
            reconcile_errors,
            dropped_keys,
            reconcile_duration,
        }
    }

    pub(crate) fn record_reconcile(&self, kind: ResourceKind, duration: Duration, success: bool) {
        let labels = &[KeyValue::new("resource_type", kind.as_str())];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        if !success {
            self.reconcile_errors.add(1, labels);
        }
    }

    pub(crate) fn record_dropped(&self, kind: ResourceKind) {
        self.dropped_keys
            .add(1, &[KeyValue::new("resource_type", kind.as_str())]);
    }
}
