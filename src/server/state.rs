use crate::collaborators::{
    DefaultMaintenancePageRenderer, EventSink, HealthChecker, MaintenancePageRenderer,
    MetricsCollector, NullHealthChecker, Notifier, PrometheusMetricsCollector, TracingEventSink,
    TracingNotifier,
};
use crate::config::ProxyConfig;
use crate::control_plane::maintenance::MaintenanceWorkers;
use crate::control_plane::registry::SessionRegistry;
use crate::metrics::Metrics;
use crate::routing::RouteTable;
use crate::tls::CertStore;
use std::sync::Arc;

/// Root aggregate shared by the control-plane accept loop, the data-plane
/// dispatcher, and the admin surface. Cheaply cloneable — every field is
/// already behind an `Arc`.
///
/// Unlike the teacher's `GatewayState`, there is no `ArcSwap`-based
/// hot-reload-from-file path: `RouteTable` and `SessionRegistry` only ever
/// change through the control-plane protocol, which mutates them directly
/// under their own locks, so there is nothing here to swap wholesale.
#[derive(Clone)]
pub struct ProxyState {
    pub routes: Arc<RouteTable>,
    pub sessions: Arc<SessionRegistry>,
    pub maintenance: Arc<MaintenanceWorkers>,
    pub cert_store: Arc<CertStore>,
    pub events: Arc<dyn EventSink>,
    pub health: Arc<dyn HealthChecker>,
    pub metrics: Arc<dyn MetricsCollector>,
    /// Handle to the installed Prometheus recorder, distinct from `metrics`
    /// above: this one owns the global recorder and renders the `/metrics`
    /// exposition text, rather than recording individual events.
    pub metrics_registry: Metrics,
    pub maintenance_page: Arc<dyn MaintenancePageRenderer>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<ProxyConfig>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            routes: Arc::new(RouteTable::new()),
            sessions: Arc::new(SessionRegistry::new()),
            maintenance: Arc::new(MaintenanceWorkers::new(config.maint_worker_pool_size)),
            cert_store: Arc::new(CertStore::new()),
            events: Arc::new(TracingEventSink),
            health: Arc::new(NullHealthChecker),
            metrics: Arc::new(PrometheusMetricsCollector),
            metrics_registry: Metrics::install(),
            maintenance_page: Arc::new(DefaultMaintenancePageRenderer),
            notifier: Arc::new(TracingNotifier),
            config: Arc::new(config),
        }
    }

    pub fn reconnect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.reconnect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_with_empty_routing_table() {
        let state = ProxyState::new(ProxyConfig::default());
        assert!(state.routes.route_summaries().is_empty());
        assert_eq!(state.sessions.session_count(), 0);
    }
}
