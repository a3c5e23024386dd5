use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
/// Control-plane metrics registry shared by all coordinators in a process.
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    queries_executed: CounterVec,
    backends_dispatched: CounterVec,
    rpc_retries: CounterVec,
    cancel_rpcs: CounterVec,
    scan_ranges_assigned: CounterVec,
    remaining_backends: GaugeVec,
}

impl MetricsRegistry {
    /// Creates a registry with all control-plane metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Counts one finished query with its terminal result label.
    pub fn inc_queries_executed(&self, result: &str) {
        self.inner
            .queries_executed
            .with_label_values(&[result])
            .inc();
    }

    /// Adds dispatched fragment-instance count for a query.
    pub fn add_backends_dispatched(&self, query_id: &str, count: u64) {
        self.inner
            .backends_dispatched
            .with_label_values(&[query_id])
            .inc_by(count as f64);
    }

    /// Counts one retry-after-reopen for the named RPC.
    pub fn inc_rpc_retries(&self, rpc: &str) {
        self.inner.rpc_retries.with_label_values(&[rpc]).inc();
    }

    /// Counts one CancelPlanFragment RPC sent for a query.
    pub fn inc_cancel_rpcs(&self, query_id: &str) {
        self.inner.cancel_rpcs.with_label_values(&[query_id]).inc();
    }

    /// Adds scan ranges distributed across execution hosts for a query.
    pub fn add_scan_ranges_assigned(&self, query_id: &str, count: u64) {
        self.inner
            .scan_ranges_assigned
            .with_label_values(&[query_id])
            .inc_by(count as f64);
    }

    /// Records how many backends have not yet reported completion.
    pub fn set_remaining_backends(&self, query_id: &str, remaining: u64) {
        self.inner
            .remaining_backends
            .with_label_values(&[query_id])
            .set(remaining as f64);
    }

    /// Renders the registry in Prometheus text exposition format.
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

        let queries_executed = counter_vec(
            &registry,
            "kite_coordinator_queries_executed_total",
            "Queries dispatched by this process, labelled by terminal result",
            &["result"],
        );
        let backends_dispatched = counter_vec(
            &registry,
            "kite_coordinator_backends_dispatched_total",
            "Remote fragment instances dispatched",
            &["query_id"],
        );
        let rpc_retries = counter_vec(
            &registry,
            "kite_coordinator_rpc_retries_total",
            "Backend RPCs retried after a client reopen",
            &["rpc"],
        );
        let cancel_rpcs = counter_vec(
            &registry,
            "kite_coordinator_cancel_rpcs_total",
            "CancelPlanFragment RPCs sent",
            &["query_id"],
        );
        let scan_ranges_assigned = counter_vec(
            &registry,
            "kite_coordinator_scan_ranges_assigned_total",
            "Scan ranges distributed to execution hosts",
            &["query_id"],
        );
        let remaining_backends = gauge_vec(
            &registry,
            "kite_coordinator_remaining_backends",
            "Backends that have not yet reported completion",
            &["query_id"],
        );

        Self {
            registry,
            queries_executed,
            backends_dispatched,
            rpc_retries,
            cancel_rpcs,
            scan_ranges_assigned,
            remaining_backends,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry used when the embedder does not inject its own.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.add_backends_dispatched("q1", 5);
        m.inc_rpc_retries("ExecPlanFragment");
        let text = m.render_prometheus();
        assert!(text.contains("kite_coordinator_backends_dispatched_total"));
        assert!(text.contains("kite_coordinator_rpc_retries_total"));
    }
}
