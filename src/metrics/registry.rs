use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for the forward-path latency (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the admin `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup before any
    /// `counter!` / `gauge!` / `histogram!` call.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "buffy_requests_total",
            Unit::Count,
            "Total inbound requests dispatched to an endpoint handler"
        );
        describe_counter!(
            "buffy_admission_rejected_total",
            Unit::Count,
            "Total requests rejected because an endpoint was at max_queue"
        );
        describe_gauge!(
            "buffy_endpoint_curconn",
            Unit::Count,
            "Current in-flight admitted connections per endpoint"
        );
        describe_histogram!(
            "buffy_forward_duration_seconds",
            Unit::Seconds,
            "Time spent in the forward retry/wait loop before a response was produced"
        );
        describe_counter!(
            "buffy_forward_timeout_total",
            Unit::Count,
            "Total forwards that exhausted their deadline and received a synthesized 503"
        );

        describe_gauge!(
            "buffy_upstream_availability",
            Unit::Count,
            "Upstream availability: 1=available 0=unavailable, absent until the first probe"
        );
        describe_gauge!(
            "buffy_upstream_gate",
            Unit::Count,
            "Upstream gate: 1=open 0=closed"
        );
        describe_counter!(
            "buffy_probe_total",
            Unit::Count,
            "Total liveness probe attempts"
        );
        describe_counter!(
            "buffy_availability_transitions_total",
            Unit::Count,
            "Total availability state transitions observed by a probe task"
        );

        describe_counter!(
            "buffy_notify_sent_total",
            Unit::Count,
            "Total notification webhook posts that completed"
        );
        describe_counter!(
            "buffy_notify_failed_total",
            Unit::Count,
            "Total notification webhook posts that errored or timed out"
        );
        describe_counter!(
            "buffy_notify_dropped_total",
            Unit::Count,
            "Total notifications dropped because the bounded channel was full"
        );

        describe_gauge!(
            "buffy_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "buffy_connections_total",
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
