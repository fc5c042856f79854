use crate::backend::Backend;
use crate::error::ProxyError;
use crate::routing::rate_limit::RateLimitCounter;
use crate::routing::route::{DrainState, Route, RouteSummary};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct Inner {
    routes: HashMap<String, Arc<Route>>,
    backends: HashMap<String, Arc<Backend>>,
    rate_limiters: HashMap<String, Arc<RateLimitCounter>>,
}

/// In-memory routing table: an exact-host + literal-prefix-path match over
/// the routes a control-plane session has registered, plus the lifecycle of
/// the `Backend` instances those routes reference.
///
/// Unlike the radix-tree/wildcard-host partitioning this module's ancestor
/// used, matching here is a linear scan sorted by `effective_priority()` —
/// route counts per proxy are small (operator-registered, not
/// service-mesh-scale), so the simpler algorithm is the right fit.
pub struct RouteTable {
    inner: RwLock<Inner>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                routes: HashMap::new(),
                backends: HashMap::new(),
                rate_limiters: HashMap::new(),
            }),
        }
    }

    /// Finds (and lazily creates) the shared `Backend` for `backend_url`.
    /// Multiple routes pointing at the same url share one transport pool,
    /// circuit breaker, and policy set.
    pub fn ensure_backend(&self, backend_url: &str) -> Result<Arc<Backend>, ProxyError> {
        if let Some(existing) = self.inner.read().unwrap().backends.get(backend_url) {
            return Ok(existing.clone());
        }
        let backend = Backend::new(backend_url)?;
        let mut inner = self.inner.write().unwrap();
        Ok(inner
            .backends
            .entry(backend_url.to_string())
            .or_insert(backend)
            .clone())
    }

    pub fn add_route(&self, route: Route) -> Result<(), ProxyError> {
        if route.domains.is_empty() {
            return Err(ProxyError::Validation("route domains must not be empty".into()));
        }
        if route.path.is_empty() || !route.path.starts_with('/') {
            return Err(ProxyError::Validation("route path must start with '/'".into()));
        }
        self.ensure_backend(&route.backend_url)?;
        let mut inner = self.inner.write().unwrap();
        inner.routes.insert(route.route_id.clone(), Arc::new(route));
        metrics::gauge!("relaykeep_routes_active").set(inner.routes.len() as f64);
        Ok(())
    }

    pub fn remove_route(&self, route_id: &str) -> Option<Arc<Route>> {
        let mut inner = self.inner.write().unwrap();
        inner.rate_limiters.remove(route_id);
        let removed = inner.routes.remove(route_id);
        metrics::gauge!("relaykeep_routes_active").set(inner.routes.len() as f64);
        removed
    }

    /// Checks and consumes one slot against `route_id`'s rate limit counter,
    /// lazily creating it on first use. Returns `true` if the request is
    /// allowed to proceed.
    pub fn check_rate_limit(&self, route_id: &str, spec: &crate::routing::route::RateLimitSpec) -> bool {
        let existing = self.inner.read().unwrap().rate_limiters.get(route_id).cloned();
        let counter = match existing {
            Some(c) => c,
            None => {
                let mut inner = self.inner.write().unwrap();
                inner.rate_limiters.entry(route_id.to_string()).or_insert_with(|| Arc::new(RateLimitCounter::new())).clone()
            }
        };
        counter.check(spec)
    }

    /// Removes every route owned by `session_id`, returning the removed ids.
    /// Called when a control-plane session disconnects past its grace
    /// period without reconnecting.
    pub fn remove_routes_owned_by(&self, session_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();
        let removed: Vec<String> = inner
            .routes
            .values()
            .filter(|r| r.owner_session_id == session_id)
            .map(|r| r.route_id.clone())
            .collect();
        for id in &removed {
            inner.routes.remove(id);
            inner.rate_limiters.remove(id);
        }
        metrics::gauge!("relaykeep_routes_active").set(inner.routes.len() as f64);
        removed
    }

    fn mutate_route(&self, route_id: &str, f: impl FnOnce(&mut Route)) -> Result<(), ProxyError> {
        let mut inner = self.inner.write().unwrap();
        let current = inner
            .routes
            .get(route_id)
            .ok_or_else(|| ProxyError::Protocol(format!("unknown route: {route_id}")))?;
        let mut updated = (**current).clone();
        f(&mut updated);
        inner.routes.insert(route_id.to_string(), Arc::new(updated));
        Ok(())
    }

    pub fn set_route_enabled(&self, route_id: &str, enabled: bool) -> Result<(), ProxyError> {
        self.mutate_route(route_id, |r| r.enabled = enabled)
    }

    pub fn set_maintenance(&self, route_id: &str, on: bool, page_url: Option<String>) -> Result<(), ProxyError> {
        self.mutate_route(route_id, |r| {
            r.maintenance = on;
            if on {
                r.maintenance_page_url = page_url;
            } else {
                r.maintenance_page_url = None;
            }
        })
    }

    pub fn start_drain(&self, route_id: &str, duration: Duration) -> Result<(), ProxyError> {
        self.mutate_route(route_id, |r| {
            r.drain = Some(DrainState {
                started_at: std::time::Instant::now(),
                duration,
            });
        })
    }

    pub fn cancel_drain(&self, route_id: &str) -> Result<(), ProxyError> {
        self.mutate_route(route_id, |r| r.drain = None)
    }

    /// Drops routes whose drain window has fully elapsed, instead converting
    /// them into a disabled state — called periodically by the same sweeper
    /// that prunes expired sessions.
    pub fn reap_expired_drains(&self) {
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<String> = inner
            .routes
            .values()
            .filter(|r| r.drain.as_ref().is_some_and(|d| d.expired()))
            .map(|r| r.route_id.clone())
            .collect();
        for id in expired {
            if let Some(current) = inner.routes.get(&id) {
                let mut updated = (**current).clone();
                updated.drain = None;
                updated.enabled = false;
                inner.routes.insert(id, Arc::new(updated));
            }
        }
    }

    /// Finds the highest-`effective_priority` enabled route whose host
    /// matches exactly and whose path is a prefix of `path`.
    pub fn find_route(&self, host: &str, path: &str) -> Option<Arc<Route>> {
        let inner = self.inner.read().unwrap();
        inner
            .routes
            .values()
            .filter(|r| r.matches(host, path))
            .max_by_key(|r| r.effective_priority())
            .cloned()
    }

    pub fn find_backend(&self, backend_url: &str) -> Option<Arc<Backend>> {
        self.inner.read().unwrap().backends.get(backend_url).cloned()
    }

    pub fn route_summaries(&self) -> Vec<RouteSummary> {
        self.inner.read().unwrap().routes.values().map(|r| r.as_ref().into()).collect()
    }

    pub fn backend_statuses(&self) -> Vec<(String, bool, &'static str)> {
        self.inner
            .read()
            .unwrap()
            .backends
            .values()
            .map(|b| (b.url().to_string(), b.healthy(), b.circuit_state()))
            .collect()
    }

    /// Drops backends no route references anymore. Called after a batch of
    /// route removals so idle transport pools don't linger forever.
    pub fn prune_unreferenced_backends(&self) {
        let mut inner = self.inner.write().unwrap();
        let referenced: std::collections::HashSet<String> =
            inner.routes.values().map(|r| r.backend_url.clone()).collect();
        inner.backends.retain(|url, _| referenced.contains(url));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::route::Route;

    fn route(id: &str, host: &str, path: &str, priority: i32) -> Route {
        Route {
            route_id: id.to_string(),
            domains: vec![host.to_string()],
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
    fn add_and_find_route() {
        let table = RouteTable::new();
        table.add_route(route("rt-1", "example.com", "/api", 0)).unwrap();
        let found = table.find_route("example.com", "/api/users").unwrap();
        assert_eq!(found.route_id, "rt-1");
    }

    #[test]
    fn longest_prefix_wins_among_matches() {
        let table = RouteTable::new();
        table.add_route(route("rt-short", "example.com", "/api", 0)).unwrap();
        table.add_route(route("rt-long", "example.com", "/api/v2", 0)).unwrap();
        let found = table.find_route("example.com", "/api/v2/users").unwrap();
        assert_eq!(found.route_id, "rt-long");
    }

    #[test]
    fn remove_route_stops_matching() {
        let table = RouteTable::new();
        table.add_route(route("rt-1", "example.com", "/api", 0)).unwrap();
        table.remove_route("rt-1");
        assert!(table.find_route("example.com", "/api").is_none());
    }

    #[test]
    fn rejects_empty_domains() {
        let table = RouteTable::new();
        let mut r = route("rt-1", "example.com", "/api", 0);
        r.domains.clear();
        assert!(table.add_route(r).is_err());
    }

    #[test]
    fn shared_backend_reused_across_routes() {
        let table = RouteTable::new();
        table.add_route(route("rt-1", "a.example.com", "/x", 0)).unwrap();
        table.add_route(route("rt-2", "b.example.com", "/y", 0)).unwrap();
        assert_eq!(table.backend_statuses().len(), 1);
    }

    #[test]
    fn prune_drops_backends_with_no_remaining_route() {
        let table = RouteTable::new();
        table.add_route(route("rt-1", "a.example.com", "/x", 0)).unwrap();
        table.remove_route("rt-1");
        table.prune_unreferenced_backends();
        assert_eq!(table.backend_statuses().len(), 0);
    }

    #[test]
    fn check_rate_limit_rejects_past_the_configured_count() {
        let table = RouteTable::new();
        let spec = crate::routing::route::RateLimitSpec { requests: 2, window_secs: 60 };
        assert!(table.check_rate_limit("rt-1", &spec));
        assert!(table.check_rate_limit("rt-1", &spec));
        assert!(!table.check_rate_limit("rt-1", &spec));
    }

    #[test]
    fn remove_routes_owned_by_session() {
        let table = RouteTable::new();
        table.add_route(route("rt-1", "a.example.com", "/x", 0)).unwrap();
        table.add_route(route("rt-2", "b.example.com", "/y", 0)).unwrap();
        let removed = table.remove_routes_owned_by("sess-1");
        assert_eq!(removed.len(), 2);
        assert!(table.find_route("a.example.com", "/x").is_none());
    }
}
