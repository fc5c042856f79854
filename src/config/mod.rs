pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProxyConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for process-level settings. When the file does
    /// not exist, built-in defaults are used — allowing the proxy to start
    /// with zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded relaykeep process configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for process-level settings.
    /// Routes, Backends, and Sessions are never read from files or env vars
    /// — they only ever enter through the control-plane session protocol.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAYKEEP_HTTP_LISTEN") {
            self.http_listen = v;
        }
        if let Ok(v) = std::env::var("RELAYKEEP_HTTPS_LISTEN") {
            self.https_listen = v;
        }
        if let Ok(v) = std::env::var("RELAYKEEP_HTTP3_LISTEN") {
            self.http3_listen = Some(v);
        }
        if let Ok(v) = std::env::var("RELAYKEEP_CONTROL_LISTEN") {
            self.control_listen = v;
        }
        if let Ok(v) = std::env::var("RELAYKEEP_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
        if let Ok(v) = std::env::var("RELAYKEEP_RECONNECT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.reconnect_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RELAYKEEP_STAGED_CONFIG_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.staged_config_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RELAYKEEP_DEBUG") {
            self.debug = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.http_listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("http_listen is not a valid socket address: {}", self.http_listen);
        }
        if self.https_listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("https_listen is not a valid socket address: {}", self.https_listen);
        }
        if self.control_listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!(
                "control_listen is not a valid socket address: {}",
                self.control_listen
            );
        }
        if let Some(addr) = &self.http3_listen {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                anyhow::bail!("http3_listen is not a valid socket address: {}", addr);
            }
        }
        for cert in &self.certificates {
            if cert.domains.is_empty() {
                anyhow::bail!("certificate entry has no domains: {}", cert.cert_path);
            }
        }
        if self.maint_worker_pool_size == 0 {
            anyhow::bail!("maint_worker_pool_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = ProxyConfig::load(Path::new("/nonexistent/relaykeep.toml")).unwrap();
        assert_eq!(cfg.http_listen, "0.0.0.0:80");
    }

    #[test]
    fn load_toml_file() {
        let mut file = tempfile_toml();
        writeln!(file.0, r#"http_listen = "127.0.0.1:8080""#).unwrap();
        let cfg = ProxyConfig::load(&file.1).unwrap();
        assert_eq!(cfg.http_listen, "127.0.0.1:8080");
    }

    #[test]
    fn validate_rejects_bad_listen_addr() {
        let mut cfg = ProxyConfig::default();
        cfg.http_listen = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_cert_domains() {
        let mut cfg = ProxyConfig::default();
        cfg.certificates.push(CertificateEntry {
            domains: vec![],
            cert_path: "/tmp/cert.pem".to_string(),
            key_path: "/tmp/key.pem".to_string(),
        });
        assert!(cfg.validate().is_err());
    }

    fn tempfile_toml() -> (std::fs::File, std::path::PathBuf) {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("relaykeep-test-{:?}.toml", std::thread::current().id()));
        let file = std::fs::File::create(&path).unwrap();
        (file, path)
    }
}
