//! Trait seams the core calls into but never assumes an implementation for.
//!
//! Grounded on the teacher's split between the routing/proxy core and opaque
//! infra (etcd client, consul client, metrics registry) that core code only
//! ever touches through a narrow method set.

use bytes::Bytes;
use std::net::IpAddr;
use std::time::Duration;

/// An opaque record the core hands to `EventSink` — access logs, WAF blocks,
/// rate-limit violations, audit entries. The sink decides storage/shipping.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub kind: &'static str,
    pub session_id: Option<String>,
    pub route_id: Option<String>,
    pub detail: String,
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: EventRecord);
}

/// No-op sink used when no persistent event log is wired up.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: EventRecord) {}
}

/// Logs every event at debug via `tracing` — the default when the binary has
/// no external event-log store configured.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: EventRecord) {
        tracing::debug!(
            kind = event.kind,
            session_id = event.session_id.as_deref(),
            route_id = event.route_id.as_deref(),
            detail = %event.detail,
            "event"
        );
    }
}

/// Independent background health checking for a Backend. `add_service`
/// starts probing; the implementation reports healthiness back by calling
/// the Backend's healthy setter (wired by the caller, not this trait).
pub trait HealthChecker: Send + Sync {
    fn add_service(
        &self,
        name: String,
        url: String,
        interval: Duration,
        timeout: Duration,
        expected_status: u16,
    );
    fn remove_service(&self, name: &str);
}

pub struct NullHealthChecker;

impl HealthChecker for NullHealthChecker {
    fn add_service(&self, _: String, _: String, _: Duration, _: Duration, _: u16) {}
    fn remove_service(&self, _: &str) {}
}

/// Narrow metrics calls the core makes; never generic counter/gauge access so
/// call sites stay self-documenting.
pub trait MetricsCollector: Send + Sync {
    fn record_retry_attempt(&self, backend_url: &str, attempt: u32);
    fn record_websocket_transfer(&self, backend_url: &str, bytes_up: u64, bytes_down: u64);
    fn record_slow_request(&self, route_id: &str, elapsed: Duration, severity: &str);
    fn record_request(&self, route_id: &str, status: u16, elapsed: Duration);
    fn record_circuit_state_change(&self, backend_url: &str, state: &str);
    fn record_blackhole(&self);
}

pub struct NullMetricsCollector;

impl MetricsCollector for NullMetricsCollector {
    fn record_retry_attempt(&self, _: &str, _: u32) {}
    fn record_websocket_transfer(&self, _: &str, _: u64, _: u64) {}
    fn record_slow_request(&self, _: &str, _: Duration, _: &str) {}
    fn record_request(&self, _: &str, _: u16, _: Duration) {}
    fn record_circuit_state_change(&self, _: &str, _: &str) {}
    fn record_blackhole(&self) {}
}

/// Backed by the global `metrics` recorder installed in `crate::metrics`.
pub struct PrometheusMetricsCollector;

impl MetricsCollector for PrometheusMetricsCollector {
    fn record_retry_attempt(&self, backend_url: &str, attempt: u32) {
        metrics::counter!(
            "relaykeep_upstream_retries_total",
            "backend" => backend_url.to_owned(),
        )
        .increment(1);
        tracing::debug!(backend = backend_url, attempt, "retry attempt");
    }

    fn record_websocket_transfer(&self, backend_url: &str, bytes_up: u64, bytes_down: u64) {
        metrics::counter!(
            "relaykeep_websocket_bytes_total",
            "backend" => backend_url.to_owned(),
            "direction" => "up",
        )
        .increment(bytes_up);
        metrics::counter!(
            "relaykeep_websocket_bytes_total",
            "backend" => backend_url.to_owned(),
            "direction" => "down",
        )
        .increment(bytes_down);
    }

    fn record_slow_request(&self, route_id: &str, elapsed: Duration, severity: &str) {
        metrics::counter!(
            "relaykeep_slow_requests_total",
            "route" => route_id.to_owned(),
            "severity" => severity.to_owned(),
        )
        .increment(1);
        tracing::warn!(route_id, severity, elapsed_ms = elapsed.as_millis() as u64, "slow request");
    }

    fn record_request(&self, route_id: &str, status: u16, elapsed: Duration) {
        metrics::counter!(
            "relaykeep_http_requests_total",
            "route" => route_id.to_owned(),
            "status" => status.to_string(),
        )
        .increment(1);
        metrics::histogram!(
            "relaykeep_http_request_duration_seconds",
            "route" => route_id.to_owned(),
        )
        .record(elapsed.as_secs_f64());
    }

    fn record_circuit_state_change(&self, backend_url: &str, state: &str) {
        metrics::gauge!(
            "relaykeep_circuit_breaker_state",
            "backend" => backend_url.to_owned(),
        )
        .set(match state {
            "open" => 1.0,
            "half_open" => 0.5,
            _ => 0.0,
        });
    }

    fn record_blackhole(&self) {
        metrics::counter!("relaykeep_blackhole_total").increment(1);
    }
}

/// Writes the 503 body served when a Route is flagged `maintenance`.
pub trait MaintenancePageRenderer: Send + Sync {
    fn render(&self, domain: &str) -> Bytes;
}

/// Minimal built-in page; operators typically supply their own renderer.
pub struct DefaultMaintenancePageRenderer;

impl MaintenancePageRenderer for DefaultMaintenancePageRenderer {
    fn render(&self, domain: &str) -> Bytes {
        Bytes::from(format!(
            "<html><body><h1>{domain} is temporarily down for maintenance</h1></body></html>"
        ))
    }
}

/// Alert payload for slow-request and circuit-breaker-state-change events.
#[derive(Debug, Clone)]
pub struct Alert {
    pub summary: String,
    pub backend_url: Option<String>,
    pub route_id: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn send(&self, alert: Alert);
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, _alert: Alert) {}
}

pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send(&self, alert: Alert) {
        tracing::warn!(
            backend = alert.backend_url.as_deref(),
            route_id = alert.route_id.as_deref(),
            "{}",
            alert.summary
        );
    }
}

/// Peer IP for tests that drive a dispatch function directly without a real
/// socket accept.
pub fn loopback() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}
