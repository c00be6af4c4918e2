//! Prometheus metrics hook for `windowgate`.
//! Bring your own `prometheus::Registry`; collectors are registered on construction.
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `windowgate_requests_total` | counter | `key`, `result` (`allowed`/`rejected`) |
//! | `windowgate_operation_duration_seconds` | histogram | `key`, `operation` |
//! | `windowgate_waiting_queue_size` | gauge | `key` |
//! | `windowgate_active_limiters` | gauge | `kind` |

use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use windowgate::{Metrics, MetricsHook};

const NAMESPACE: &str = "windowgate";

#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
    requests: IntCounterVec,
    latency: HistogramVec,
    waiting: GaugeVec,
    active: GaugeVec,
}

impl PrometheusMetrics {
    /// Create the hook and register its collectors into `registry`.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Admission decisions by key and result").namespace(NAMESPACE),
            &["key", "result"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Limiter operation latency in seconds")
                .namespace(NAMESPACE)
                .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["key", "operation"],
        )?;
        let waiting = GaugeVec::new(
            Opts::new("waiting_queue_size", "Poll cycles of the current wait per key").namespace(NAMESPACE),
            &["key"],
        )?;
        let active = GaugeVec::new(
            Opts::new("active_limiters", "Live limiter instances by kind").namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(waiting.clone()))?;
        registry.register(Box::new(active.clone()))?;

        Ok(Self { registry, requests, latency, waiting, active })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Wrap this hook in a [`Metrics`] handle for limiter and middleware builders.
    pub fn into_metrics(self) -> Metrics {
        Metrics::new(self)
    }
}

impl MetricsHook for PrometheusMetrics {
    fn observe_request(&self, key: &str, allowed: bool) {
        let result = if allowed { "allowed" } else { "rejected" };
        self.requests.with_label_values(&[key, result]).inc();
    }

    fn observe_latency(&self, key: &str, operation: &str, seconds: f64) {
        self.latency.with_label_values(&[key, operation]).observe(seconds);
    }

    fn set_waiting_queue_size(&self, key: &str, size: f64) {
        self.waiting.with_label_values(&[key]).set(size);
    }

    fn set_active_limiters(&self, kind: &str, count: f64) {
        self.active.with_label_values(&[kind]).set(count);
    }
}
