//! Prometheus metrics for the bouncer
//!
//! Metrics live in a registry owned by [`BouncerMetrics`] rather than the
//! process-global one, so several pipelines (or tests) can coexist.

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics for the request pipeline, the cache and admin purges
#[derive(Clone)]
pub struct BouncerMetrics {
    registry: Registry,

    /// Requests served, by response status
    pub requests_total: Arc<IntCounterVec>,

    /// Handler failures, by handler name
    pub handler_failures_total: Arc<IntCounterVec>,

    /// Cache lookups, by result (hit, miss, error)
    pub cache_lookups_total: Arc<IntCounterVec>,

    /// Cache stores that failed and were skipped
    pub cache_store_failures_total: Arc<IntCounter>,

    /// Duration of classification plus device handling on a miss
    pub classification_duration_seconds: Arc<Histogram>,

    /// Purge requests, by result (success, failure, unauthorized)
    pub purge_requests_total: Arc<CounterVec>,
}

impl BouncerMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("ua_bouncer_requests_total", "Total number of requests served"),
            &["status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let handler_failures_total = IntCounterVec::new(
            Opts::new(
                "ua_bouncer_handler_failures_total",
                "Total number of failed handler invocations",
            ),
            &["handler"],
        )?;
        registry.register(Box::new(handler_failures_total.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("ua_bouncer_cache_lookups_total", "Total number of cache lookups"),
            &["result"], // result: hit, miss, error
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let cache_store_failures_total = IntCounter::new(
            "ua_bouncer_cache_store_failures_total",
            "Total number of cache stores that failed",
        )?;
        registry.register(Box::new(cache_store_failures_total.clone()))?;

        let classification_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ua_bouncer_classification_duration_seconds",
                "Duration of classification and device handling on cache misses",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )?;
        registry.register(Box::new(classification_duration_seconds.clone()))?;

        let purge_requests_total = CounterVec::new(
            Opts::new(
                "ua_bouncer_purge_requests_total",
                "Total number of namespace purge requests",
            ),
            &["result"],
        )?;
        registry.register(Box::new(purge_requests_total.clone()))?;

        Ok(Self {
            registry,
            requests_total: Arc::new(requests_total),
            handler_failures_total: Arc::new(handler_failures_total),
            cache_lookups_total: Arc::new(cache_lookups_total),
            cache_store_failures_total: Arc::new(cache_store_failures_total),
            classification_duration_seconds: Arc::new(classification_duration_seconds),
            purge_requests_total: Arc::new(purge_requests_total),
        })
    }

    pub fn record_request(&self, status: u16) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_handler_failure(&self, handler: &str) {
        self.handler_failures_total
            .with_label_values(&[handler])
            .inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_lookups_total.with_label_values(&["hit"]).inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_lookups_total.with_label_values(&["miss"]).inc();
    }

    pub fn record_cache_error(&self) {
        self.cache_lookups_total.with_label_values(&["error"]).inc();
    }

    pub fn record_store_failure(&self) {
        self.cache_store_failures_total.inc();
    }

    pub fn record_classification(&self, duration_secs: f64) {
        self.classification_duration_seconds.observe(duration_secs);
    }

    pub fn record_purge(&self, result: &str) {
        self.purge_requests_total.with_label_values(&[result]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_encoded() {
        let metrics = BouncerMetrics::new().unwrap();
        metrics.record_request(200);
        metrics.record_request(302);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_handler_failure("ua-map");

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("ua_bouncer_requests_total{status=\"302\"} 1"));
        assert!(body.contains("ua_bouncer_cache_lookups_total{result=\"hit\"} 1"));
        assert!(body.contains("ua_bouncer_handler_failures_total{handler=\"ua-map\"} 1"));
    }

    #[test]
    fn test_independent_registries() {
        let first = BouncerMetrics::new().unwrap();
        let second = BouncerMetrics::new().unwrap();
        first.record_cache_hit();
        assert_eq!(first.cache_lookups_total.with_label_values(&["hit"]).get(), 1);
        assert_eq!(second.cache_lookups_total.with_label_values(&["hit"]).get(), 0);
    }
}
