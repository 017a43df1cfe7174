use std::sync::{Arc, OnceLock};

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide metrics registry for the execution core.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    arbitrator_requests: IntCounter,
    arbitrator_aborted: IntCounter,
    arbitrator_local_arbitrations: IntCounter,
    arbitrator_global_arbitration_waits: IntCounter,
    arbitrator_reclaimed_used_bytes: IntCounter,
    arbitrator_free_capacity_bytes: IntGauge,
    arbitrator_max_capacity_bytes: IntGauge,
    operator_rows_out: IntCounterVec,
    operator_batches_out: IntCounterVec,
    spill_bytes: IntCounterVec,
}

impl MetricsRegistry {
    /// Create a fresh registry with all arbor metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Count one capacity-grow request reaching the arbitrator.
    pub fn inc_arbitrator_requests(&self) {
        self.inner.arbitrator_requests.inc();
    }

    /// Count one root pool aborted by the arbitrator.
    pub fn inc_arbitrator_aborted(&self) {
        self.inner.arbitrator_aborted.inc();
    }

    /// Count one grow request satisfied purely from free capacity.
    pub fn inc_local_arbitrations(&self) {
        self.inner.arbitrator_local_arbitrations.inc();
    }

    /// Count one grow request that waited on a global arbitration round.
    pub fn inc_global_arbitration_waits(&self) {
        self.inner.arbitrator_global_arbitration_waits.inc();
    }

    /// Accumulate bytes reclaimed from victim pools.
    pub fn add_reclaimed_used_bytes(&self, bytes: u64) {
        self.inner.arbitrator_reclaimed_used_bytes.inc_by(bytes);
    }

    /// Publish the arbitrator's current free capacity.
    pub fn set_free_capacity_bytes(&self, bytes: u64) {
        self.inner.arbitrator_free_capacity_bytes.set(bytes as i64);
    }

    /// Publish the arbitrator's total capacity.
    pub fn set_max_capacity_bytes(&self, bytes: u64) {
        self.inner.arbitrator_max_capacity_bytes.set(bytes as i64);
    }

    /// Record rows/batches emitted by one operator instance.
    pub fn record_operator_output(&self, operator: &str, rows: u64, batches: u64) {
        self.inner
            .operator_rows_out
            .with_label_values(&[operator])
            .inc_by(rows);
        self.inner
            .operator_batches_out
            .with_label_values(&[operator])
            .inc_by(batches);
    }

    /// Record bytes spilled by an operator, keyed by spill kind.
    pub fn record_spill(&self, kind: &str, bytes: u64) {
        self.inner
            .spill_bytes
            .with_label_values(&[kind])
            .inc_by(bytes);
    }

    /// Render all families in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let arbitrator_requests = int_counter(
            &registry,
            "arbor_arbitrator_requests_total",
            "Capacity grow requests received by the arbitrator",
        );
        let arbitrator_aborted = int_counter(
            &registry,
            "arbor_arbitrator_aborted_total",
            "Root pools aborted by the arbitrator",
        );
        let arbitrator_local_arbitrations = int_counter(
            &registry,
            "arbor_arbitrator_local_arbitrations_total",
            "Grow requests satisfied from free capacity",
        );
        let arbitrator_global_arbitration_waits = int_counter(
            &registry,
            "arbor_arbitrator_global_arbitration_waits_total",
            "Grow requests that waited on a global arbitration round",
        );
        let arbitrator_reclaimed_used_bytes = int_counter(
            &registry,
            "arbor_arbitrator_reclaimed_used_bytes_total",
            "Bytes reclaimed from victim pools",
        );
        let arbitrator_free_capacity_bytes = int_gauge(
            &registry,
            "arbor_arbitrator_free_capacity_bytes",
            "Capacity not granted to any root pool",
        );
        let arbitrator_max_capacity_bytes = int_gauge(
            &registry,
            "arbor_arbitrator_max_capacity_bytes",
            "Total capacity managed by the arbitrator",
        );

        let operator_rows_out = int_counter_vec(
            &registry,
            "arbor_operator_rows_out_total",
            "Output rows produced per operator type",
            &["operator"],
        );
        let operator_batches_out = int_counter_vec(
            &registry,
            "arbor_operator_batches_out_total",
            "Output batches produced per operator type",
            &["operator"],
        );
        let spill_bytes = int_counter_vec(
            &registry,
            "arbor_spill_bytes_total",
            "Spill bytes written per spill kind",
            &["kind"],
        );

        Self {
            registry,
            arbitrator_requests,
            arbitrator_aborted,
            arbitrator_local_arbitrations,
            arbitrator_global_arbitration_waits,
            arbitrator_reclaimed_used_bytes,
            arbitrator_free_capacity_bytes,
            arbitrator_max_capacity_bytes,
            operator_rows_out,
            operator_batches_out,
            spill_bytes,
        }
    }
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter vec");
    c
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-global registry used by the arbitrator and operators.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.inc_arbitrator_requests();
        m.inc_local_arbitrations();
        m.set_free_capacity_bytes(1024);
        m.record_operator_output("MergeExchange", 100, 2);
        m.record_spill("aggregate", 512);
        let text = m.render_prometheus();
        assert!(text.contains("arbor_arbitrator_requests_total"));
        assert!(text.contains("arbor_arbitrator_free_capacity_bytes"));
        assert!(text.contains("MergeExchange"));
        assert!(text.contains("arbor_spill_bytes_total"));
    }
}
