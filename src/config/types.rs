use serde::{Deserialize, Serialize};

fn default_http_listen() -> String {
    "0.0.0.0:80".to_string()
}
fn default_https_listen() -> String {
    "0.0.0.0:443".to_string()
}
fn default_control_listen() -> String {
    "0.0.0.0:81".to_string()
}
fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}
fn default_reconnect_timeout_secs() -> u64 {
    300
}
fn default_staged_config_ttl_secs() -> u64 {
    1800
}
fn default_sweeper_interval_secs() -> u64 {
    5
}
fn default_staged_sweeper_interval_secs() -> u64 {
    300
}
fn default_graceful_shutdown_secs() -> u64 {
    30
}
fn default_maint_worker_pool_size() -> usize {
    5
}
fn default_tcp_keepalive_secs() -> u64 {
    30
}

/// One `(domain-pattern, cert)` tuple as supplied by the operator. Certs are
/// provided as file paths here; the TLS front door loads and hot-swaps them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateEntry {
    /// Exact host or `*.`-prefixed single-level wildcard.
    pub domains: Vec<String>,
    pub cert_path: String,
    pub key_path: String,
}

/// Process-level settings only. Business routing state (Routes, Sessions,
/// Backends) never lives here — it only ever enters through the
/// control-plane session protocol (see `control_plane`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    #[serde(default = "default_https_listen")]
    pub https_listen: String,
    /// UDP address for the HTTP/3 (QUIC) listener; defaults to the HTTPS host:port.
    #[serde(default)]
    pub http3_listen: Option<String>,
    #[serde(default = "default_control_listen")]
    pub control_listen: String,
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    #[serde(default)]
    pub certificates: Vec<CertificateEntry>,

    #[serde(default)]
    pub global_request_headers: Vec<(String, String)>,
    #[serde(default)]
    pub global_response_headers: Vec<(String, String)>,

    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
    #[serde(default = "default_staged_config_ttl_secs")]
    pub staged_config_ttl_secs: u64,
    #[serde(default = "default_sweeper_interval_secs")]
    pub grace_sweeper_interval_secs: u64,
    #[serde(default = "default_staged_sweeper_interval_secs")]
    pub staged_sweeper_interval_secs: u64,
    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,
    #[serde(default = "default_maint_worker_pool_size")]
    pub maint_worker_pool_size: usize,
    #[serde(default = "default_tcp_keepalive_secs")]
    pub control_tcp_keepalive_secs: u64,

    #[serde(default)]
    pub debug: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            https_listen: default_https_listen(),
            http3_listen: None,
            control_listen: default_control_listen(),
            admin_listen: default_admin_listen(),
            certificates: Vec::new(),
            global_request_headers: Vec::new(),
            global_response_headers: Vec::new(),
            reconnect_timeout_secs: default_reconnect_timeout_secs(),
            staged_config_ttl_secs: default_staged_config_ttl_secs(),
            grace_sweeper_interval_secs: default_sweeper_interval_secs(),
            staged_sweeper_interval_secs: default_staged_sweeper_interval_secs(),
            graceful_shutdown_secs: default_graceful_shutdown_secs(),
            maint_worker_pool_size: default_maint_worker_pool_size(),
            control_tcp_keepalive_secs: default_tcp_keepalive_secs(),
            debug: false,
        }
    }
}

/// Per-backend circuit breaker thresholds, set via the control-plane
/// `CIRCUITBREAKER_SET` command. These are the defaults applied when a
/// session never sends one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_secs: u64,
    /// Failures older than this are forgotten rather than counted toward
    /// `failure_threshold` indefinitely — bounds the closed-state counter to
    /// a sliding window instead of an all-time consecutive count.
    pub window_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_secs: 30,
            window_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.http_listen, "0.0.0.0:80");
        assert_eq!(cfg.reconnect_timeout_secs, 300);
        assert!(cfg.certificates.is_empty());
    }

    #[test]
    fn toml_roundtrip_with_partial_overrides() {
        let toml_src = r#"
            https_listen = "0.0.0.0:8443"
            reconnect_timeout_secs = 60
        "#;
        let cfg: ProxyConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.https_listen, "0.0.0.0:8443");
        assert_eq!(cfg.reconnect_timeout_secs, 60);
        assert_eq!(cfg.http_listen, "0.0.0.0:80");
        assert_eq!(cfg.admin_listen, "0.0.0.0:9091");
    }

    #[test]
    fn circuit_breaker_defaults() {
        let cb = CircuitBreakerConfig::default();
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.success_threshold, 2);
    }

    #[test]
    fn certificate_entry_roundtrip() {
        let entry = CertificateEntry {
            domains: vec!["*.example.com".to_string()],
            cert_path: "/etc/relaykeep/cert.pem".to_string(),
            key_path: "/etc/relaykeep/key.pem".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: CertificateEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
