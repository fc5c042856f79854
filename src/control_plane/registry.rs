use crate::collaborators::HealthChecker;
use crate::control_plane::session::Session;
use crate::routing::RouteTable;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

struct Entry {
    session: Arc<Session>,
    /// Set while the TCP connection is live; used to push unsolicited event
    /// lines (MAINT_OK, async ERROR) without routing through the command
    /// reply path.
    outbound: Option<UnboundedSender<String>>,
}

/// Process-wide map of sessions, keyed both by `session_id` and by
/// `(service_name, instance_name)` for re-REGISTER takeover.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Entry>>,
    by_key: Mutex<HashMap<(String, String), String>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()), by_key: Mutex::new(HashMap::new()) }
    }

    /// Registers a brand-new session, retiring any prior session for the
    /// same `(service, instance)` pair by removing its routes from `table`
    /// and deleting it from the registry.
    pub fn register(
        &self,
        session: Arc<Session>,
        outbound: UnboundedSender<String>,
        table: &RouteTable,
        health: &dyn HealthChecker,
    ) {
        let key = (session.service_name.clone(), session.instance_name.clone());

        let prior_id = self.by_key.lock().unwrap().insert(key, session.session_id.clone());
        if let Some(prior_id) = prior_id {
            self.retire(&prior_id, table, health);
        }

        self.sessions.lock().unwrap().insert(session.session_id.clone(), Entry { session, outbound: Some(outbound) });
        self.record_session_count();
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(session_id).map(|e| e.session.clone())
    }

    pub fn set_outbound(&self, session_id: &str, outbound: UnboundedSender<String>) {
        if let Some(entry) = self.sessions.lock().unwrap().get_mut(session_id) {
            entry.outbound = Some(outbound);
        }
    }

    pub fn push_event(&self, session_id: &str, line: String) {
        if let Some(entry) = self.sessions.lock().unwrap().get(session_id) {
            if let Some(tx) = &entry.outbound {
                let _ = tx.send(line);
            }
        }
    }

    /// Called when a connection handler task exits. Routes stay installed
    /// but disabled for `reconnect_timeout`; the session itself is kept.
    pub fn on_disconnect(&self, session_id: &str, table: &RouteTable) {
        let Some(session) = self.get(session_id) else { return };
        if let Some(entry) = self.sessions.lock().unwrap().get_mut(session_id) {
            entry.outbound = None;
        }
        session.mark_disconnected();
        for route_id in session.active_route_ids() {
            let _ = table.set_route_enabled(&route_id, false);
        }
    }

    pub fn on_reconnect(&self, session_id: &str, table: &RouteTable) {
        let Some(session) = self.get(session_id) else { return };
        session.reconnect();
        for route_id in session.active_route_ids() {
            let _ = table.set_route_enabled(&route_id, true);
        }
    }

    fn retire(&self, session_id: &str, table: &RouteTable, health: &dyn HealthChecker) {
        if let Some(session) = self.get(session_id) {
            for route_id in session.active_route_ids() {
                table.remove_route(&route_id);
                health.remove_service(&route_id);
            }
        }
        self.sessions.lock().unwrap().remove(session_id);
        self.by_key.lock().unwrap().retain(|_, v| v != session_id);
        table.prune_unreferenced_backends();
        self.record_session_count();
    }

    fn record_session_count(&self) {
        metrics::gauge!("relaykeep_sessions_active").set(self.session_count() as f64);
    }

    pub fn remove(&self, session_id: &str, table: &RouteTable, health: &dyn HealthChecker) {
        self.retire(session_id, table, health);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|e| SessionSummary {
                session_id: e.session.session_id.clone(),
                service_name: e.session.service_name.clone(),
                instance_name: e.session.instance_name.clone(),
                connected: e.outbound.is_some(),
                route_count: e.session.active_route_ids().len(),
            })
            .collect()
    }

    /// Grace-period sweep: disconnected sessions past `reconnect_timeout`
    /// have their routes removed and are deleted from the registry.
    pub fn sweep_expired(&self, reconnect_timeout: Duration, table: &RouteTable, health: &dyn HealthChecker) {
        let expired: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|e| matches!(e.session.disconnect_age(), Some(age) if age >= reconnect_timeout))
            .map(|e| e.session.session_id.clone())
            .collect();
        for id in expired {
            self.retire(&id, table, health);
        }
    }

    pub fn sweep_staged(&self) {
        for entry in self.sessions.lock().unwrap().values() {
            entry.session.reap_staged_if_expired();
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub service_name: String,
    pub instance_name: String,
    pub connected: bool,
    pub route_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullHealthChecker;

    fn new_session(id: &str, service: &str, instance: &str) -> Arc<Session> {
        Session::new(id.into(), service.into(), instance.into(), 9100, "{}".into())
    }

    #[test]
    fn register_then_get() {
        let registry = SessionRegistry::new();
        let table = RouteTable::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register(new_session("sess-1", "svc", "inst"), tx, &table, &NullHealthChecker);
        assert!(registry.get("sess-1").is_some());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn re_register_retires_prior_session() {
        let registry = SessionRegistry::new();
        let table = RouteTable::new();
        let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
        let s1 = new_session("sess-1", "svc", "inst");
        s1.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        s1.apply(&table, &[], &NullHealthChecker).unwrap();
        registry.register(s1, tx1, &table, &NullHealthChecker);
        assert!(table.find_route("example.com", "/api").is_some());

        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
        registry.register(new_session("sess-2", "svc", "inst"), tx2, &table, &NullHealthChecker);
        assert!(registry.get("sess-1").is_none());
        assert!(table.find_route("example.com", "/api").is_none());
    }

    #[test]
    fn disconnect_disables_then_sweep_removes() {
        let registry = SessionRegistry::new();
        let table = RouteTable::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let s = new_session("sess-1", "svc", "inst");
        s.stage_route_add("example.com", "/api", "http://127.0.0.1:9000", 0).unwrap();
        s.apply(&table, &[], &NullHealthChecker).unwrap();
        registry.register(s, tx, &table, &NullHealthChecker);

        registry.on_disconnect("sess-1", &table);
        assert!(table.find_route("example.com", "/api").is_none());

        registry.sweep_expired(Duration::from_secs(0), &table, &NullHealthChecker);
        assert!(registry.get("sess-1").is_none());
    }
}
