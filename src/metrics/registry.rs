use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions, or return a handle to the already-installed recorder.
    ///
    /// The `metrics` crate only allows one global recorder per process, so
    /// repeated calls (e.g. one `ProxyState` per integration test in the same
    /// test binary) reuse the first handle rather than panicking.
    pub fn install() -> Self {
        if let Some(handle) = RECORDER.get() {
            return Self { handle: handle.clone() };
        }

        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");
        let handle = RECORDER.get_or_init(|| handle).clone();

        describe_counter!(
            "relaykeep_http_requests_total",
            Unit::Count,
            "Total data-plane HTTP requests processed"
        );
        describe_histogram!(
            "relaykeep_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "relaykeep_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration (time spent waiting for the backend)"
        );
        describe_gauge!(
            "relaykeep_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        describe_counter!(
            "relaykeep_upstream_retries_total",
            Unit::Count,
            "Total upstream retry attempts"
        );
        describe_gauge!(
            "relaykeep_circuit_breaker_state",
            Unit::Count,
            "Per-backend circuit breaker state: 0=closed 0.5=half-open 1=open"
        );
        describe_counter!(
            "relaykeep_blackhole_total",
            Unit::Count,
            "Requests dropped because no route matched the host"
        );
        describe_counter!(
            "relaykeep_slow_requests_total",
            Unit::Count,
            "Requests exceeding the configured slow-request threshold"
        );
        describe_counter!(
            "relaykeep_websocket_bytes_total",
            Unit::Bytes,
            "Bytes spliced over hijacked WebSocket connections"
        );

        describe_gauge!(
            "relaykeep_routes_active",
            Unit::Count,
            "Number of routes currently installed in the routing table"
        );
        describe_gauge!(
            "relaykeep_sessions_active",
            Unit::Count,
            "Number of control-plane sessions currently registered"
        );
        describe_counter!(
            "relaykeep_control_plane_commands_total",
            Unit::Count,
            "Total control-plane commands processed, by command name"
        );
        describe_gauge!(
            "relaykeep_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
