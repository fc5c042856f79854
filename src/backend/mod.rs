pub mod circuit_breaker;
pub mod compression;
pub mod forwarded;
pub mod policy;
pub mod retry;
pub mod transport;
pub mod websocket;

use crate::backend::circuit_breaker::{BreakerCheck, CircuitBreaker};
use crate::backend::compression::AnyBody;
use crate::backend::policy::BackendOptions;
use crate::backend::transport::BackendClient;
use crate::collaborators::MetricsCollector;
use crate::error::ProxyError;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// One reverse-proxy target, shared by every Route whose `backend_url`
/// string-equals. Owns the transport pool, circuit breaker state, retry
/// policy, compression policy, and WebSocket tuning — everything the
/// routing table needs to forget about once it hands off a request.
pub struct Backend {
    url: String,
    scheme: String,
    host: String,
    port: u16,
    healthy: AtomicBool,
    breaker: CircuitBreaker,
    options: RwLock<BackendOptions>,
    client: RwLock<BackendClient>,
    ws_gauge: Arc<websocket::WebSocketGauge>,
}

const MAX_BUFFERED_RETRY_BODY: usize = 4 * 1024 * 1024;

impl Backend {
    pub fn new(url: &str) -> Result<Arc<Self>, ProxyError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ProxyError::Validation(format!("invalid backend url: {url}")))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ProxyError::Validation(format!("backend url missing scheme: {url}")))?
            .to_string();
        if scheme != "http" && scheme != "https" {
            return Err(ProxyError::Validation(format!("unsupported backend scheme: {scheme}")));
        }
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::Validation(format!("backend url missing host: {url}")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if scheme == "https" { 443 } else { 80 });

        let options = BackendOptions::default();
        let client = transport::build_client(&options.pool, false);

        Ok(Arc::new(Self {
            url: url.to_string(),
            scheme,
            host,
            port,
            healthy: AtomicBool::new(true),
            breaker: CircuitBreaker::new(options.circuit_breaker.clone()),
            options: RwLock::new(options),
            client: RwLock::new(client),
            ws_gauge: Arc::new(websocket::WebSocketGauge::new()),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The upstream `host:port` authority, used as the outbound `Host`
    /// header so the backend sees the same authority its `backend_url` names
    /// (matching the teacher's `"node"` pass-host mode).
    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn circuit_state(&self) -> &'static str {
        self.breaker.state_name()
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    pub fn slow_request_thresholds(&self) -> policy::SlowRequestThresholds {
        self.options.read().unwrap().slow_request
    }

    /// Applied under the Backend's internal locks when a Route referencing
    /// this url is added or its options change.
    pub fn update_policy(&self, options: BackendOptions) {
        self.breaker.update_params(options.circuit_breaker.clone());
        let tls_verify = false;
        let new_client = transport::build_client(&options.pool, tls_verify);
        *self.client.write().unwrap() = new_client;
        *self.options.write().unwrap() = options;
    }

    pub fn record_success(&self, metrics: &dyn MetricsCollector) {
        self.breaker.record_success();
        if self.breaker.state_name() != "open" {
            metrics.record_circuit_state_change(&self.url, self.breaker.state_name());
        }
    }

    pub fn record_failure(&self, metrics: &dyn MetricsCollector) {
        let tripped = self.breaker.record_failure();
        if tripped {
            metrics.record_circuit_state_change(&self.url, "open");
        }
    }

    pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
        let upgrade_hdr = req
            .headers()
            .get(http::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection_hdr = req
            .headers()
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade_hdr && connection_hdr
    }

    /// Pre-dispatch circuit breaker gate. `Err` means the caller should
    /// respond 503 without touching the transport.
    pub fn check_circuit(&self) -> Result<(), ProxyError> {
        match self.breaker.check() {
            BreakerCheck::Rejected => Err(ProxyError::CircuitOpen),
            BreakerCheck::Allowed | BreakerCheck::Probe => Ok(()),
        }
    }

    pub async fn hijack_websocket(
        self: &Arc<Self>,
        req: Request<Incoming>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<(), ProxyError> {
        let policy = self.options.read().unwrap().websocket.clone();
        let guard = self
            .ws_gauge
            .try_acquire(policy.max_connections)
            .ok_or(ProxyError::Capacity)?;

        let url = self.url.clone();
        let scheme = self.scheme.clone();
        let host = self.host.clone();
        let port = self.port;
        let result = websocket::hijack_and_splice(req, &scheme, &host, port, &policy, move |up, down| {
            metrics.record_websocket_transfer(&url, up, down);
        })
        .await;
        drop(guard);
        result
    }

    /// Ordinary (non-WebSocket) request dispatch: rewrites `Host`, injects
    /// forwarding headers, retries per policy, and applies response
    /// compression when eligible. On success, updates the circuit breaker
    /// from the final status; on transport failure, records a failure and
    /// returns a 502-mapped error.
    pub async fn serve_http(
        self: &Arc<Self>,
        mut req: Request<AnyBody>,
        peer_ip: IpAddr,
        original_host: &str,
        metrics: &dyn MetricsCollector,
    ) -> Result<Response<AnyBody>, ProxyError> {
        forwarded::inject_forwarded_headers(req.headers_mut(), peer_ip, original_host);
        if let Ok(host_value) = http::HeaderValue::from_str(&self.authority()) {
            req.headers_mut().insert(http::header::HOST, host_value);
        }

        let (mut parts, body) = req.into_parts();
        parts.uri = self.rewrite_uri(&parts.uri)?;

        let options = self.options.read().unwrap().clone();
        let retry_enabled = options.retry.enabled && options.retry.max_attempts > 1;

        let method = parts.method.clone();
        let accept_encoding = parts.headers.get(http::header::ACCEPT_ENCODING).cloned();

        let response = if retry_enabled {
            let collected = body
                .collect()
                .await
                .map_err(|e| ProxyError::Transport(e.to_string()))?
                .to_bytes();
            if collected.len() > MAX_BUFFERED_RETRY_BODY {
                return Err(ProxyError::Validation("request body too large to retry".into()));
            }
            let parts_ref = &parts;
            let client = self.client.read().unwrap().clone();
            let start = Instant::now();
            let timeout = transport::request_timeout(&options.pool);
            let result = retry::send_with_retry(
                &client,
                || {
                    let body: AnyBody = Full::new(collected.clone())
                        .map_err(|never| match never {})
                        .boxed();
                    Request::from_parts(parts_ref.clone(), body)
                },
                &options.retry,
                timeout,
                |attempt| {
                    if attempt > 1 {
                        metrics.record_retry_attempt(&self.url, attempt);
                    }
                },
            )
            .await;
            let _ = start;
            result
        } else {
            let client = self.client.read().unwrap().clone();
            let timeout = transport::request_timeout(&options.pool);
            let req = Request::from_parts(parts, body);
            tokio::time::timeout(timeout, client.request(req))
                .await
                .map_err(|_| ProxyError::Transport("request timed out".into()))
                .and_then(|r| r.map_err(|e| ProxyError::Transport(e.to_string())))
        };

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() >= 500 {
                    self.record_failure(metrics);
                } else {
                    self.record_success(metrics);
                }
                Ok(self.apply_response_compression(resp, &method, accept_encoding.as_ref(), &options))
            }
            Err(e) => {
                self.record_failure(metrics);
                Err(e)
            }
        }
    }

    fn rewrite_uri(&self, original: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = original.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path_and_query)
            .parse()
            .map_err(|_| ProxyError::Internal("failed to rewrite upstream uri".into()))
    }

    fn apply_response_compression(
        &self,
        resp: Response<Incoming>,
        method: &http::Method,
        accept_encoding: Option<&http::HeaderValue>,
        options: &BackendOptions,
    ) -> Response<AnyBody> {
        let (mut parts, body) = resp.into_parts();
        if !compression::is_eligible(&options.compression, method, parts.status, &parts.headers) {
            return Response::from_parts(parts, body.map_err(|e| e.into()).boxed());
        }
        let Some(algorithm) = compression::negotiate_encoding(&options.compression, accept_encoding) else {
            return Response::from_parts(parts, body.map_err(|e| e.into()).boxed());
        };

        parts.headers.remove(http::header::CONTENT_LENGTH);
        parts.headers.insert(
            http::header::CONTENT_ENCODING,
            http::HeaderValue::from_static(compression::encoding_token(algorithm)),
        );
        compression::add_vary_accept_encoding(&mut parts.headers);

        let compressed = compression::compress_body(body, algorithm, options.compression.level);
        Response::from_parts(parts, compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_missing_scheme() {
        assert!(Backend::new("example.com:9000").is_err());
    }

    #[test]
    fn new_rejects_unsupported_scheme() {
        assert!(Backend::new("ftp://example.com").is_err());
    }

    #[test]
    fn new_accepts_http_and_https() {
        assert!(Backend::new("http://127.0.0.1:9000").is_ok());
        assert!(Backend::new("https://example.com").is_ok());
    }

    #[test]
    fn rewrite_uri_preserves_path_and_query() {
        let backend = Backend::new("http://upstream.internal:9000").unwrap();
        let original: Uri = "https://public.example.com/v1/users?x=1".parse().unwrap();
        let rewritten = backend.rewrite_uri(&original).unwrap();
        assert_eq!(rewritten.to_string(), "http://upstream.internal:9000/v1/users?x=1");
    }

    #[test]
    fn circuit_state_starts_closed() {
        let backend = Backend::new("http://127.0.0.1:9000").unwrap();
        assert_eq!(backend.circuit_state(), "closed");
        assert!(backend.check_circuit().is_ok());
    }

    #[test]
    fn reset_circuit_forces_closed() {
        let backend = Backend::new("http://127.0.0.1:9000").unwrap();
        for _ in 0..10 {
            backend.breaker.record_failure();
        }
        assert_eq!(backend.circuit_state(), "open");
        backend.reset_circuit();
        assert_eq!(backend.circuit_state(), "closed");
    }
}
