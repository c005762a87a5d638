//! Controller metrics (optional `metrics` feature), mirroring the shape of a
//! `prometheus`-backed `ControllerMetrics`: a handful of counters the
//! reconciler and monitor bump, rendered as text for scraping.

use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};

pub struct ControllerMetrics {
    registry: Registry,
    pub reconcile_total: IntCounterVec,
    pub reconcile_errors_total: IntCounterVec,
    pub monitor_probe_errors_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("vault_operator_reconcile_total", "Reconcile passes started"),
            &["cluster"],
        )
        .expect("metric names are valid");
        let reconcile_errors_total = IntCounterVec::new(
            Opts::new(
                "vault_operator_reconcile_errors_total",
                "Reconcile passes that returned an error",
            ),
            &["cluster"],
        )
        .expect("metric names are valid");
        let monitor_probe_errors_total = IntCounterVec::new(
            Opts::new(
                "vault_operator_monitor_probe_errors_total",
                "Health probe ticks where every pod was unreachable",
            ),
            &["cluster"],
        )
        .expect("metric names are valid");

        registry
            .register(Box::new(reconcile_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(reconcile_errors_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(monitor_probe_errors_total.clone()))
            .expect("unique metric name");

        ControllerMetrics {
            registry,
            reconcile_total,
            reconcile_errors_total,
            monitor_probe_errors_total,
        }
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
