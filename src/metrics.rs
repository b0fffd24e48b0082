use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub route: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UpdateOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpdateLabels {
    pub outcome: UpdateOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the mirror server.
///
/// Counters are registered without the `_total` suffix; the encoder adds it.
pub struct Metrics {
    // -- http --
    pub http_requests_total: Family<RequestLabels, Counter>,

    // -- mirror refresh --
    pub mirror_updates_total: Family<UpdateLabels, Counter>,
    pub mirror_retries_total: Counter,
    pub mirror_update_duration_seconds: Histogram,
    pub active_refreshes: Gauge,
}

impl Metrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let http_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gitmirror_http_requests",
            "HTTP requests by git route and response status",
            http_requests_total.clone(),
        );

        let mirror_updates_total = Family::<UpdateLabels, Counter>::default();
        registry.register(
            "gitmirror_mirror_updates",
            "Mirror update attempts by outcome",
            mirror_updates_total.clone(),
        );

        let mirror_retries_total = Counter::default();
        registry.register(
            "gitmirror_mirror_retries",
            "Mirror update retries after a failure",
            mirror_retries_total.clone(),
        );

        let mirror_update_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 12));
        registry.register(
            "gitmirror_mirror_update_duration_seconds",
            "Duration of a single mirror update attempt in seconds",
            mirror_update_duration_seconds.clone(),
        );

        let active_refreshes: Gauge = Gauge::default();
        registry.register(
            "gitmirror_active_refreshes",
            "Repositories currently refreshing",
            active_refreshes.clone(),
        );

        Self {
            http_requests_total,
            mirror_updates_total,
            mirror_retries_total,
            mirror_update_duration_seconds,
            active_refreshes,
        }
    }

    pub fn record_request(&self, route: &str, status: u16) {
        self.http_requests_total
            .get_or_create(&RequestLabels {
                route: route.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_update(&self, outcome: UpdateOutcome, seconds: f64) {
        self.mirror_updates_total
            .get_or_create(&UpdateLabels { outcome })
            .inc();
        self.mirror_update_duration_seconds.observe(seconds);
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`]
/// and by the refresh scheduler.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render every metric in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recorded_values() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_request("info_refs", 200);
        registry.metrics.record_update(UpdateOutcome::Failure, 1.5);
        registry.metrics.mirror_retries_total.inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("gitmirror_http_requests_total{route=\"info_refs\",status=\"200\"} 1"));
        assert!(text.contains("gitmirror_mirror_updates_total{outcome=\"Failure\"} 1"));
        assert!(text.contains("gitmirror_mirror_retries_total 1"));
    }
}
