//! Metrics module for Prometheus
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by method, route, and status
//! - Time to upstream response headers
//! - In-flight requests gauge
//! - Upstream failures by kind
//! - Process metrics (Linux only)

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Route label used for requests that matched no rule
pub const UNMATCHED_ROUTE: &str = "none";

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_duration: HistogramVec,
    in_flight: GaugeVec,
    upstream_errors: CounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "route", "status"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Time until response headers were sent, in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "route"],
        )?;

        let in_flight = GaugeVec::new(
            Opts::new(
                "gateway_in_flight_requests",
                "Number of requests waiting on an upstream",
            ),
            &["route"],
        )?;

        let upstream_errors = CounterVec::new(
            Opts::new(
                "gateway_upstream_errors_total",
                "Total number of failed upstream requests",
            ),
            &["route", "kind"],
        )?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            request_counter,
            request_duration,
            in_flight,
            upstream_errors,
        })
    }

    /// Record a finished request with its status and latency
    pub fn record_request(&self, method: &str, route: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        self.request_counter
            .with_label_values(&[method, route, &status_str])
            .inc();

        self.request_duration
            .with_label_values(&[method, route])
            .observe(latency.as_secs_f64());
    }

    /// Record a failed upstream call
    pub fn record_upstream_error(&self, route: &str, kind: &str) {
        self.upstream_errors.with_label_values(&[route, kind]).inc();
    }

    /// Track a request in flight until the returned guard is dropped
    pub fn track_in_flight(&self, route: &str) -> InFlightGuard {
        let gauge = self.in_flight.with_label_values(&[route]);
        gauge.inc();
        InFlightGuard { gauge }
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}

/// Decrements the in-flight gauge on drop, including when the request is cancelled
pub struct InFlightGuard {
    gauge: prometheus::Gauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
