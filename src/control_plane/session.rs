use crate::backend::policy::CompressionAlgorithm;
use crate::collaborators::{HealthChecker, MaintenancePageRenderer};
use crate::error::ProxyError;
use crate::ids::next_route_id;
use crate::routing::route::{
    CircuitBreakerParams, DrainState, HeaderOp, HeaderOpAction, HealthCheckSpec, RateLimitSpec, Route,
};
use crate::routing::RouteTable;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
struct StagedRoute {
    route_id: String,
    domains: Vec<String>,
    path: String,
    backend_url: String,
    priority: i32,
}

/// Everything `ROUTE_ADD`..`CONFIG_ROLLBACK` mutate before a `CONFIG_APPLY`.
/// Kept entirely separate from `active` — staged state never influences
/// dispatch.
#[derive(Debug, Default)]
struct Staged {
    routes_add: Vec<StagedRoute>,
    routes_remove: Vec<String>,
    headers: Vec<HeaderOp>,
    options: HashMap<String, String>,
    health: HashMap<String, HealthCheckSpec>,
    ratelimit: HashMap<String, RateLimitSpec>,
    circuit: HashMap<String, CircuitBreakerParams>,
    expires_at: Option<Instant>,
}

impl Staged {
    fn touch(&mut self, ttl: Duration) {
        self.expires_at = Some(Instant::now() + ttl);
    }

    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Instant::now() >= t)
    }

    fn clear(&mut self) {
        *self = Staged::default();
    }

    fn is_empty(&self) -> bool {
        self.routes_add.is_empty()
            && self.routes_remove.is_empty()
            && self.headers.is_empty()
            && self.options.is_empty()
            && self.health.is_empty()
            && self.ratelimit.is_empty()
            && self.circuit.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigDiff {
    pub routes_add: usize,
    pub routes_remove: usize,
    pub headers: usize,
    pub options: usize,
    pub health: usize,
    pub ratelimit: usize,
    pub circuit: usize,
}

/// A connected (or gracefully disconnected) control-plane client. One per
/// `(service_name, instance_name)` pair at a time — a matching REGISTER
/// retires the previous holder.
pub struct Session {
    pub session_id: String,
    pub service_name: String,
    pub instance_name: String,
    pub maint_port: u16,
    pub metadata_json: String,

    pub connected_at: Instant,
    last_activity_at: Mutex<Instant>,
    pub disconnected_at: Mutex<Option<Instant>>,
    pub routes_deactivated: Mutex<bool>,

    active: Mutex<HashMap<String, Route>>,
    staged: Mutex<Staged>,
    subscriptions: Mutex<std::collections::HashSet<String>>,
    drain: Mutex<Option<DrainState>>,
}

const DEFAULT_STAGED_TTL: Duration = Duration::from_secs(30 * 60);

impl Session {
    pub fn new(session_id: String, service_name: String, instance_name: String, maint_port: u16, metadata_json: String) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            service_name,
            instance_name,
            maint_port,
            metadata_json,
            connected_at: Instant::now(),
            last_activity_at: Mutex::new(Instant::now()),
            disconnected_at: Mutex::new(None),
            routes_deactivated: Mutex::new(false),
            active: Mutex::new(HashMap::new()),
            staged: Mutex::new(Staged::default()),
            subscriptions: Mutex::new(std::collections::HashSet::new()),
            drain: Mutex::new(None),
        })
    }

    pub fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Instant::now();
    }

    pub fn active_route_ids(&self) -> Vec<String> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    pub fn subscribe(&self, event_type: &str) {
        self.subscriptions.lock().unwrap().insert(event_type.to_string());
    }

    pub fn unsubscribe(&self, event_type: &str) {
        self.subscriptions.lock().unwrap().remove(event_type);
    }

    pub fn stage_route_add(&self, domains_csv: &str, path: &str, url: &str, priority: i32) -> Result<String, ProxyError> {
        let domains: Vec<String> = domains_csv.split(',').map(|d| d.trim().to_string()).filter(|d| !d.is_empty()).collect();
        if domains.is_empty() {
            return Err(ProxyError::Validation("ROUTE_ADD: domains must not be empty".into()));
        }
        if !path.starts_with('/') {
            return Err(ProxyError::Validation("ROUTE_ADD: path must start with '/'".into()));
        }
        if !url.contains("://") {
            return Err(ProxyError::Validation("ROUTE_ADD: url must include a scheme".into()));
        }
        let route_id = next_route_id();
        let mut staged = self.staged.lock().unwrap();
        staged.routes_add.push(StagedRoute { route_id: route_id.clone(), domains, path: path.to_string(), backend_url: url.to_string(), priority });
        staged.touch(DEFAULT_STAGED_TTL);
        Ok(route_id)
    }

    pub fn stage_route_remove(&self, route_id: &str) {
        let mut staged = self.staged.lock().unwrap();
        staged.routes_remove.push(route_id.to_string());
        staged.touch(DEFAULT_STAGED_TTL);
    }

    /// Copies the route into the staged-add list if it isn't staged already
    /// (the active version, so an update on its own doesn't require a prior
    /// ROUTE_ADD), then patches the named field. Goes through the same
    /// upsert-by-route_id path as a fresh ROUTE_ADD at CONFIG_APPLY time.
    pub fn stage_route_update(&self, route_id: &str, field: &str, value: &str) -> Result<(), ProxyError> {
        let mut staged = self.staged.lock().unwrap();
        if !staged.routes_add.iter().any(|r| r.route_id == route_id) {
            let active = self.active.lock().unwrap();
            let route = active
                .get(route_id)
                .ok_or_else(|| ProxyError::Validation(format!("ROUTE_UPDATE: unknown route {route_id}")))?;
            staged.routes_add.push(StagedRoute {
                route_id: route.route_id.clone(),
                domains: route.domains.clone(),
                path: route.path.clone(),
                backend_url: route.backend_url.clone(),
                priority: route.priority,
            });
        }

        let staged_route = staged.routes_add.iter_mut().find(|r| r.route_id == route_id).unwrap();
        match field {
            "domains" => {
                staged_route.domains = value.split(',').map(|d| d.trim().to_string()).filter(|d| !d.is_empty()).collect();
            }
            "path" => staged_route.path = value.to_string(),
            "backend_url" => staged_route.backend_url = value.to_string(),
            "priority" => {
                staged_route.priority =
                    value.parse().map_err(|_| ProxyError::Validation("ROUTE_UPDATE: invalid priority".into()))?;
            }
            other => return Err(ProxyError::Validation(format!("ROUTE_UPDATE: unknown field {other}"))),
        }
        staged.touch(DEFAULT_STAGED_TTL);
        Ok(())
    }

    pub fn stage_header(&self, name: &str, value: Option<String>, action: HeaderOpAction) {
        let mut staged = self.staged.lock().unwrap();
        staged.headers.push(HeaderOp { name: name.to_string(), value, action });
        staged.touch(DEFAULT_STAGED_TTL);
    }

    pub fn stage_option(&self, key: &str, value: &str) {
        let mut staged = self.staged.lock().unwrap();
        staged.options.insert(key.to_string(), value.to_string());
        staged.touch(DEFAULT_STAGED_TTL);
    }

    pub fn stage_health(&self, route_id: &str, path: &str, interval_secs: u64, timeout_secs: u64) {
        let mut staged = self.staged.lock().unwrap();
        staged.health.insert(
            route_id.to_string(),
            HealthCheckSpec { path: path.to_string(), interval: Duration::from_secs(interval_secs), timeout: Duration::from_secs(timeout_secs) },
        );
        staged.touch(DEFAULT_STAGED_TTL);
    }

    pub fn stage_ratelimit(&self, route_id: &str, requests: u64, window_secs: u64) {
        let mut staged = self.staged.lock().unwrap();
        staged.ratelimit.insert(route_id.to_string(), RateLimitSpec { requests, window_secs });
        staged.touch(DEFAULT_STAGED_TTL);
    }

    pub fn stage_circuit_breaker(&self, route_id: &str, field: &str, value: &str) -> Result<(), ProxyError> {
        let mut staged = self.staged.lock().unwrap();
        let entry = staged.circuit.entry(route_id.to_string()).or_default();
        let parsed: u64 = value.parse().map_err(|_| ProxyError::Validation(format!("CIRCUIT_BREAKER_SET: invalid value for {field}")))?;
        match field {
            "failure_threshold" => entry.failure_threshold = Some(parsed as u32),
            "success_threshold" => entry.success_threshold = Some(parsed as u32),
            "open_duration_secs" => entry.open_duration_secs = Some(parsed),
            other => return Err(ProxyError::Validation(format!("CIRCUIT_BREAKER_SET: unknown field {other}"))),
        }
        staged.touch(DEFAULT_STAGED_TTL);
        Ok(())
    }

    pub fn rollback(&self) {
        self.staged.lock().unwrap().clear();
    }

    pub fn reap_staged_if_expired(&self) {
        let mut staged = self.staged.lock().unwrap();
        if staged.expired() {
            staged.clear();
        }
    }

    pub fn diff(&self) -> ConfigDiff {
        let staged = self.staged.lock().unwrap();
        ConfigDiff {
            routes_add: staged.routes_add.len(),
            routes_remove: staged.routes_remove.len(),
            headers: staged.headers.len(),
            options: staged.options.len(),
            health: staged.health.len(),
            ratelimit: staged.ratelimit.len(),
            circuit: staged.circuit.len(),
        }
    }

    pub fn validate_staged(&self) -> Result<(), ProxyError> {
        let staged = self.staged.lock().unwrap();
        for r in &staged.routes_add {
            if r.domains.is_empty() || r.path.is_empty() || !r.backend_url.contains("://") {
                return Err(ProxyError::Validation(format!("staged route {} is invalid", r.route_id)));
            }
        }
        Ok(())
    }

    /// Commits staged state into `table`, restricted to `scopes` (empty =
    /// all). Table-level atomicity: every newly-added route is tracked so a
    /// later failure rolls back by removing them again, leaving the table as
    /// it was before this call.
    pub fn apply(&self, table: &RouteTable, scopes: &[&str], health: &dyn HealthChecker) -> Result<(), ProxyError> {
        self.validate_staged()?;
        let all = scopes.is_empty();
        let want = |s: &str| all || scopes.contains(&s);

        let mut staged = self.staged.lock().unwrap();
        let mut active = self.active.lock().unwrap();
        let mut committed_ids: Vec<String> = Vec::new();

        if want("routes") {
            for staged_route in &staged.routes_add {
                let route = Route {
                    route_id: staged_route.route_id.clone(),
                    domains: staged_route.domains.clone(),
                    path: staged_route.path.clone(),
                    backend_url: staged_route.backend_url.clone(),
                    priority: staged_route.priority,
                    owner_session_id: self.session_id.clone(),
                    headers: staged.headers.clone(),
                    websocket_allowed: parse_bool(staged.options.get("websocket")).unwrap_or(false),
                    health: staged.health.get(&staged_route.route_id).cloned(),
                    rate_limit: staged.ratelimit.get(&staged_route.route_id).cloned(),
                    circuit_breaker_override: staged.circuit.get(&staged_route.route_id).cloned(),
                    maintenance: false,
                    maintenance_page_url: None,
                    drain: None,
                    enabled: true,
                };
                if let Err(e) = table.add_route(route.clone()) {
                    for id in &committed_ids {
                        table.remove_route(id);
                    }
                    return Err(e);
                }
                committed_ids.push(staged_route.route_id.clone());
                active.insert(staged_route.route_id.clone(), route);
            }

            for route_id in &staged.routes_remove {
                table.remove_route(route_id);
                active.remove(route_id);
            }
        }

        if want("headers") {
            for op in &staged.headers {
                apply_header_op(&mut active, op);
            }
        }

        if want("options") {
            apply_backend_options(table, &active, &staged.options);
        }

        if want("health") || want("ratelimit") || want("circuit") {
            for (route_id, route) in active.iter_mut() {
                if want("health") {
                    if let Some(spec) = staged.health.get(route_id) {
                        route.health = Some(spec.clone());
                        let check_url = format!("{}{}", route.backend_url, spec.path);
                        health.add_service(route_id.clone(), check_url, spec.interval, spec.timeout, 200);
                    }
                }
                if want("ratelimit") {
                    if let Some(spec) = staged.ratelimit.get(route_id) {
                        route.rate_limit = Some(spec.clone());
                    }
                }
                if want("circuit") {
                    if let Some(params) = staged.circuit.get(route_id) {
                        route.circuit_breaker_override = Some(params.clone());
                    }
                }
            }
        }

        staged.clear();
        table.prune_unreferenced_backends();
        Ok(())
    }

    pub fn mark_disconnected(&self) {
        *self.disconnected_at.lock().unwrap() = Some(Instant::now());
        *self.routes_deactivated.lock().unwrap() = true;
    }

    pub fn reconnect(&self) {
        *self.disconnected_at.lock().unwrap() = None;
        *self.routes_deactivated.lock().unwrap() = false;
    }

    pub fn disconnect_age(&self) -> Option<Duration> {
        self.disconnected_at.lock().unwrap().map(|t| t.elapsed())
    }

    pub fn start_drain(&self, duration: Duration) {
        *self.drain.lock().unwrap() = Some(DrainState { started_at: Instant::now(), duration });
    }

    pub fn cancel_drain(&self) {
        *self.drain.lock().unwrap() = None;
    }

    pub fn drain_status(&self) -> Option<f64> {
        self.drain.lock().unwrap().as_ref().map(|d| d.reject_probability())
    }

    pub fn set_maintenance(&self, target: &str, on: bool, page_url: Option<String>) -> Vec<String> {
        let mut active = self.active.lock().unwrap();
        let ids: Vec<String> = if target.eq_ignore_ascii_case("ALL") {
            active.keys().cloned().collect()
        } else {
            vec![target.to_string()]
        };
        for id in &ids {
            if let Some(route) = active.get_mut(id) {
                route.maintenance = on;
                route.maintenance_page_url = if on { page_url.clone() } else { None };
            }
        }
        ids
    }

    pub fn maintenance_route_ids(&self) -> Vec<String> {
        self.active.lock().unwrap().values().filter(|r| r.maintenance).map(|r| r.route_id.clone()).collect()
    }
}

fn parse_bool(v: Option<&String>) -> Option<bool> {
    v.and_then(|s| match s.as_str() {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    })
}

/// Parses the `OPTIONS_SET compression_level` value: `fastest`, `best`, or a
/// bare integer (brotli/gzip quality, 0-11 and 0-9 respectively — out-of-range
/// values are clamped by the underlying encoder).
fn parse_compression_level(v: &str) -> Option<async_compression::Level> {
    match v.trim().to_ascii_lowercase().as_str() {
        "fastest" => Some(async_compression::Level::Fastest),
        "best" => Some(async_compression::Level::Best),
        "default" => Some(async_compression::Level::Default),
        other => other.parse::<i32>().ok().map(async_compression::Level::Precise),
    }
}

fn apply_header_op(active: &mut HashMap<String, Route>, op: &HeaderOp) {
    for route in active.values_mut() {
        route.headers.retain(|existing| existing.name != op.name);
        route.headers.push(op.clone());
    }
}

/// `OPTIONS_SET`/`_REMOVE` target `ALL` — every active route's Backend gets
/// the parsed pool/compression/websocket knobs. `timeout`/`*_interval` are
/// durations; `websocket`/`compression`/`http2`/`http3` are booleans.
fn apply_backend_options(table: &RouteTable, active: &HashMap<String, Route>, options: &HashMap<String, String>) {
    if options.is_empty() {
        return;
    }
    let mut urls: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for route in active.values() {
        urls.insert(route.backend_url.as_str());
    }
    for url in urls {
        let Some(backend) = table.find_backend(url) else { continue };
        let mut opts = crate::backend::policy::BackendOptions::default();
        if let Some(v) = options.get("timeout").and_then(|v| humantime::parse_duration(v).ok()) {
            opts.pool.overall_timeout = v;
        }
        if let Some(v) = options.get("connect_interval").and_then(|v| humantime::parse_duration(v).ok()) {
            opts.pool.connect_timeout = v;
        }
        if let Some(b) = parse_bool(options.get("compression")) {
            opts.compression.enabled = b;
        }
        if let Some(b) = parse_bool(options.get("websocket")) {
            opts.websocket.max_connections = if b { opts.websocket.max_connections } else { 0 };
        }
        if let Some(algs) = options.get("compression_algorithms") {
            opts.compression.algorithms = algs
                .split(',')
                .filter_map(|a| match a.trim() {
                    "br" | "brotli" => Some(CompressionAlgorithm::Brotli),
                    "gzip" => Some(CompressionAlgorithm::Gzip),
                    _ => None,
                })
                .collect();
            if opts.compression.algorithms.is_empty() {
                opts.compression.algorithms = vec![CompressionAlgorithm::Brotli, CompressionAlgorithm::Gzip];
            }
        }
        if let Some(level) = options.get("compression_level").and_then(|v| parse_compression_level(v)) {
            opts.compression.level = level;
        }
        backend.update_policy(opts);
    }
}

pub fn render_maintenance_body(renderer: &dyn MaintenancePageRenderer, domain: &str) -> bytes::Bytes {
    renderer.render(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullHealthChecker;

    fn table() -> RouteTable {
        RouteTable::new()
    }

    #[test]
    fn stage_and_apply_route() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        let route_id = session.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        let table = table();
        session.apply(&table, &[], &NullHealthChecker).unwrap();
        assert!(table.find_route("example.com", "/api").is_some());
        assert_eq!(session.active_route_ids(), vec![route_id]);
    }

    #[test]
    fn rollback_discards_staged_route() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        session.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        session.rollback();
        let table = table();
        session.apply(&table, &[], &NullHealthChecker).unwrap();
        assert!(table.find_route("example.com", "/api").is_none());
    }

    #[test]
    fn stage_route_add_rejects_bad_url() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        assert!(session.stage_route_add("example.com", "/api", "no-scheme", 0).is_err());
    }

    #[test]
    fn diff_reflects_staged_counts() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        session.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        session.stage_route_remove("rt-other");
        let diff = session.diff();
        assert_eq!(diff.routes_add, 1);
        assert_eq!(diff.routes_remove, 1);
    }

    #[test]
    fn stage_route_update_patches_active_route_on_apply() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        let route_id = session.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        let table = table();
        session.apply(&table, &[], &NullHealthChecker).unwrap();

        session.stage_route_update(&route_id, "path", "/v2").unwrap();
        session.apply(&table, &[], &NullHealthChecker).unwrap();

        assert!(table.find_route("example.com", "/api").is_none());
        assert!(table.find_route("example.com", "/v2").is_some());
    }

    #[test]
    fn stage_route_update_rejects_unknown_route() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        assert!(session.stage_route_update("rt-missing", "path", "/v2").is_err());
    }

    #[test]
    fn maintenance_all_flags_every_active_route() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        session.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        let table = table();
        session.apply(&table, &[], &NullHealthChecker).unwrap();
        session.set_maintenance("ALL", true, Some("https://status.example.com".into()));
        assert_eq!(session.maintenance_route_ids().len(), 1);
    }

    #[derive(Default)]
    struct RecordingHealthChecker {
        added: Mutex<Vec<String>>,
    }

    impl HealthChecker for RecordingHealthChecker {
        fn add_service(&self, name: String, url: String, _interval: Duration, _timeout: Duration, _expected_status: u16) {
            self.added.lock().unwrap().push(format!("{name}@{url}"));
        }
        fn remove_service(&self, _name: &str) {}
    }

    #[test]
    fn apply_registers_staged_health_check_with_checker() {
        let session = Session::new("sess-1".into(), "svc".into(), "inst".into(), 9100, "{}".into());
        let route_id = session.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        session.stage_health(&route_id, "/healthz", 10, 2);
        let table = table();
        let checker = RecordingHealthChecker::default();
        session.apply(&table, &[], &checker).unwrap();

        let added = checker.added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0], format!("{route_id}@http://127.0.0.1:9000/healthz"));
    }
}
