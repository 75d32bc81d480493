use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the admin
/// `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "mirrorgate_http_requests_total",
            Unit::Count,
            "Total registry requests processed"
        );
        describe_histogram!(
            "mirrorgate_http_request_duration_seconds",
            Unit::Seconds,
            "Request duration until response headers, client perspective"
        );
        describe_histogram!(
            "mirrorgate_upstream_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting for upstream response headers"
        );
        describe_counter!(
            "mirrorgate_bytes_streamed_total",
            Unit::Bytes,
            "Response body bytes delivered to clients"
        );
        describe_counter!(
            "mirrorgate_failover_total",
            Unit::Count,
            "Requests retried against the next mirror candidate"
        );

        // mirror health
        describe_gauge!(
            "mirrorgate_mirror_health",
            Unit::Count,
            "Mirror health from active probes: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "mirrorgate_probe_total",
            Unit::Count,
            "Total active probe attempts"
        );

        // token broker
        describe_counter!(
            "mirrorgate_token_cache_total",
            Unit::Count,
            "Token cache lookups by result"
        );
        describe_counter!(
            "mirrorgate_token_fetch_total",
            Unit::Count,
            "Token realm fetches by result"
        );

        // accounting
        describe_counter!(
            "mirrorgate_traffic_dropped_total",
            Unit::Count,
            "Traffic records dropped because the queue was full"
        );

        // connections
        describe_gauge!(
            "mirrorgate_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "mirrorgate_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
