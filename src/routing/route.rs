use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One ordered header mutation staged by HEADERS_SET/_REMOVE and merged into
/// a Route at CONFIG_APPLY time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderOp {
    pub name: String,
    pub value: Option<String>,
    pub action: HeaderOpAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HeaderOpAction {
    Set,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub requests: u64,
    pub window_secs: u64,
}

/// Partial override of a Backend's circuit breaker parameters — any field
/// left `None` keeps the Backend's current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerParams {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub open_duration_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DrainState {
    pub started_at: Instant,
    pub duration: Duration,
}

impl DrainState {
    /// Linearly ramping rejection probability as the drain window elapses.
    pub fn reject_probability(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let total = self.duration.as_secs_f64().max(f64::EPSILON);
        (elapsed / total).clamp(0.0, 1.0)
    }

    pub fn expired(&self) -> bool {
        self.started_at.elapsed() >= self.duration
    }
}

/// Immutable once applied into the routing table; replaced wholesale on
/// ROUTE_UPDATE rather than mutated in place.
#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: String,
    pub domains: Vec<String>,
    pub path: String,
    pub backend_url: String,
    pub priority: i32,
    pub owner_session_id: String,

    pub headers: Vec<HeaderOp>,
    pub websocket_allowed: bool,
    pub health: Option<HealthCheckSpec>,
    pub rate_limit: Option<RateLimitSpec>,
    pub circuit_breaker_override: Option<CircuitBreakerParams>,

    pub maintenance: bool,
    pub maintenance_page_url: Option<String>,
    pub drain: Option<DrainState>,

    pub enabled: bool,
}

impl Route {
    /// `max(priority, len(path))` — longer prefixes win ties against an
    /// explicitly lower numeric priority.
    pub fn effective_priority(&self) -> i32 {
        self.priority.max(self.path.len() as i32)
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        self.enabled
            && self.domains.iter().any(|d| d == host)
            && path.starts_with(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub route_id: String,
    pub domains: Vec<String>,
    pub path: String,
    pub backend_url: String,
    pub priority: i32,
    pub enabled: bool,
    pub maintenance: bool,
    pub draining: bool,
    pub owner_session_id: String,
}

impl From<&Route> for RouteSummary {
    fn from(r: &Route) -> Self {
        Self {
            route_id: r.route_id.clone(),
            domains: r.domains.clone(),
            path: r.path.clone(),
            backend_url: r.backend_url.clone(),
            priority: r.priority,
            enabled: r.enabled,
            maintenance: r.maintenance,
            draining: r.drain.is_some(),
            owner_session_id: r.owner_session_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, priority: i32) -> Route {
        Route {
            route_id: "rt-1".to_string(),
            domains: vec!["example.com".to_string()],
            path: path.to_string(),
            backend_url: "http://127.0.0.1:9000".to_string(),
            priority,
            owner_session_id: "sess-1".to_string(),
            headers: Vec::new(),
            websocket_allowed: false,
            health: None,
            rate_limit: None,
            circuit_breaker_override: None,
            maintenance: false,
            maintenance_page_url: None,
            drain: None,
            enabled: true,
        }
    }

    #[test]
    fn effective_priority_prefers_longer_path() {
        let short = route("/a", 1);
        let long = route("/api/v1", 1);
        assert!(long.effective_priority() > short.effective_priority());
    }

    #[test]
    fn effective_priority_honors_explicit_priority_when_higher() {
        let r = route("/a", 100);
        assert_eq!(r.effective_priority(), 100);
    }

    #[test]
    fn matches_requires_exact_host_and_prefix_path() {
        let r = route("/api", 0);
        assert!(r.matches("example.com", "/api/v1/users"));
        assert!(!r.matches("other.com", "/api/v1/users"));
        assert!(!r.matches("example.com", "/other"));
    }

    #[test]
    fn disabled_route_never_matches() {
        let mut r = route("/api", 0);
        r.enabled = false;
        assert!(!r.matches("example.com", "/api"));
    }

    #[test]
    fn drain_probability_ramps_linearly() {
        let drain = DrainState {
            started_at: Instant::now() - Duration::from_secs(5),
            duration: Duration::from_secs(10),
        };
        let p = drain.reject_probability();
        assert!(p > 0.4 && p < 0.6);
        assert!(!drain.expired());
    }
}
