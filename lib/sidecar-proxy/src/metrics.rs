//! Prometheus metrics for forwarding and registration

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics collector for the sidecar
#[derive(Clone)]
pub struct MetricsCollector {
    /// Inbound requests by route and response status
    pub inbound_requests_total: CounterVec,
    /// Forwarded calls by kind (`rpc`/`http`) and outcome
    pub forward_requests_total: CounterVec,
    /// Forwarded call latency in seconds
    pub forward_duration_seconds: HistogramVec,
    /// Registry calls by operation and outcome
    pub registry_operations_total: CounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let inbound_requests_total = CounterVec::new(
            Opts::new("sidecar_inbound_requests_total", "Total inbound requests"),
            &["route", "status"],
        )?;

        let forward_requests_total = CounterVec::new(
            Opts::new("sidecar_forward_requests_total", "Total forwarded backend calls"),
            &["kind", "outcome"],
        )?;

        let forward_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sidecar_forward_duration_seconds",
                "Forwarded backend call latency in seconds",
            ),
            &["kind"],
        )?;

        let registry_operations_total = CounterVec::new(
            Opts::new("sidecar_registry_operations_total", "Total registry calls"),
            &["operation", "outcome"],
        )?;

        registry.register(Box::new(inbound_requests_total.clone()))?;
        registry.register(Box::new(forward_requests_total.clone()))?;
        registry.register(Box::new(forward_duration_seconds.clone()))?;
        registry.register(Box::new(registry_operations_total.clone()))?;

        Ok(Self {
            inbound_requests_total,
            forward_requests_total,
            forward_duration_seconds,
            registry_operations_total,
            registry,
        })
    }

    pub fn record_inbound(&self, route: &str, status: u16) {
        self.inbound_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Record one forwarded call; `outcome` is `ok` or an error kind
    pub fn record_forward(&self, kind: &str, outcome: &str, elapsed: Duration) {
        self.forward_requests_total
            .with_label_values(&[kind, outcome])
            .inc();
        self.forward_duration_seconds
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_registry(&self, operation: &str, outcome: &str) {
        self.registry_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        assert!(MetricsCollector::new().is_ok());
    }

    #[test]
    fn test_record_and_gather() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_forward("rpc", "ok", Duration::from_millis(12));
        metrics.record_forward("http", "unreachable", Duration::from_millis(3));
        metrics.record_registry("register", "ok");
        metrics.record_inbound("/rpc", 200);

        let text = metrics.gather().unwrap();
        assert!(text.contains("sidecar_forward_requests_total{kind=\"rpc\",outcome=\"ok\"} 1"));
        let unreachable = r#"sidecar_forward_requests_total{kind="http",outcome="unreachable"} 1"#;
        assert!(text.contains(unreachable));
        let registered =
            r#"sidecar_registry_operations_total{operation="register",outcome="ok"} 1"#;
        assert!(text.contains(registered));
        assert!(text.contains("sidecar_inbound_requests_total{route=\"/rpc\",status=\"200\"} 1"));
        assert!(text.contains("sidecar_forward_duration_seconds_count{kind=\"rpc\"} 1"));
    }

    #[test]
    fn test_clones_share_registry() {
        let metrics = MetricsCollector::new().unwrap();
        let clone = metrics.clone();
        clone.record_registry("deregister", "ok");

        let text = metrics.gather().unwrap();
        let deregistered =
            r#"sidecar_registry_operations_total{operation="deregister",outcome="ok"} 1"#;
        assert!(text.contains(deregistered));
    }
}
