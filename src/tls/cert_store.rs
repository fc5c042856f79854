use crate::config::CertificateEntry;
use crate::error::ProxyError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::{Arc, RwLock};

struct Entry {
    domains: Vec<String>,
    certified_key: Arc<CertifiedKey>,
}

/// SNI-keyed certificate table. Read-mostly: dispatch reads happen on every
/// TLS handshake, `update_certificates` is an occasional admin-driven
/// hot-swap under the writer lock.
pub struct CertStore {
    entries: RwLock<Vec<Entry>>,
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CertStore {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Loads every `(domains, cert_path, key_path)` triple and replaces the
    /// whole table atomically. A single bad entry fails the whole call,
    /// leaving the previous table in place.
    pub fn update_certificates(&self, certs: &[CertificateEntry]) -> Result<(), ProxyError> {
        let mut loaded = Vec::with_capacity(certs.len());
        for cert in certs {
            let certified_key = load_certified_key(&cert.cert_path, &cert.key_path)?;
            loaded.push(Entry { domains: cert.domains.clone(), certified_key: Arc::new(certified_key) });
        }
        *self.entries.write().unwrap() = loaded;
        Ok(())
    }

    fn resolve_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() {
            return None;
        }
        if let Some(name) = server_name {
            let name = name.to_ascii_lowercase();
            for entry in entries.iter() {
                if entry.domains.iter().any(|d| d.eq_ignore_ascii_case(&name)) {
                    return Some(entry.certified_key.clone());
                }
            }
            for entry in entries.iter() {
                if entry.domains.iter().any(|pattern| matches_wildcard(pattern, &name)) {
                    return Some(entry.certified_key.clone());
                }
            }
        }
        tracing::warn!(server_name, "tls: no certificate matched SNI, falling back to first");
        entries.first().map(|e| e.certified_key.clone())
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_for(client_hello.server_name())
    }
}

/// `*.a.b` matches `c.a.b` but not `d.c.a.b`: pattern must start with `*.`,
/// domain must end with the pattern's base, the remaining prefix must be
/// non-empty, end with `.`, and itself contain no further `.`.
fn matches_wildcard(pattern: &str, domain: &str) -> bool {
    let Some(base) = pattern.strip_prefix("*.") else { return false };
    let base = base.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    let Some(prefix) = domain.strip_suffix(&format!(".{base}")) else { return false };
    !prefix.is_empty() && !prefix.contains('.')
}

fn load_certified_key(cert_path: &str, key_path: &str) -> Result<CertifiedKey, ProxyError> {
    let cert_bytes = std::fs::read(cert_path)
        .map_err(|e| ProxyError::Fatal(format!("reading cert {cert_path}: {e}")))?;
    let key_bytes = std::fs::read(key_path)
        .map_err(|e| ProxyError::Fatal(format!("reading key {key_path}: {e}")))?;

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Fatal(format!("parsing cert {cert_path}: {e}")))?;
    if chain.is_empty() {
        return Err(ProxyError::Fatal(format!("no certificates found in {cert_path}")));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| ProxyError::Fatal(format!("parsing key {key_path}: {e}")))?
        .ok_or_else(|| ProxyError::Fatal(format!("no private key found in {key_path}")))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Fatal(format!("unsupported key type in {key_path}: {e}")))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_one_level_only() {
        assert!(matches_wildcard("*.a.b", "c.a.b"));
        assert!(!matches_wildcard("*.a.b", "d.c.a.b"));
        assert!(!matches_wildcard("*.a.b", "a.b"));
    }

    #[test]
    fn wildcard_is_case_insensitive() {
        assert!(matches_wildcard("*.Example.com", "api.example.COM"));
    }

    #[test]
    fn empty_store_resolves_nothing() {
        let store = CertStore::new();
        assert!(store.resolve_for(Some("example.com")).is_none());
        assert!(store.is_empty());
    }
}
