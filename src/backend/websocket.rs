use crate::backend::policy::WebSocketPolicy;
use crate::error::ProxyError;
use bytes::Bytes;
use http::{HeaderMap, Request};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

/// Counts concurrently-active hijacked WebSocket connections against a
/// Backend's `max_connections`.
pub struct WebSocketGauge {
    active: AtomicU64,
}

impl WebSocketGauge {
    pub fn new() -> Self {
        Self { active: AtomicU64::new(0) }
    }

    /// Returns a guard on success, `None` if `max_connections` was reached.
    pub fn try_acquire(self: &Arc<Self>, max_connections: u64) -> Option<WebSocketGuard> {
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current >= max_connections {
                return None;
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(WebSocketGuard { gauge: self.clone() });
            }
        }
    }
}

pub struct WebSocketGuard {
    gauge: Arc<WebSocketGauge>,
}

impl Drop for WebSocketGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::AcqRel);
    }
}

type BoxedStream = Box<dyn AsyncReadWrite + Send + Unpin>;

trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

async fn dial_upstream(scheme: &str, host: &str, port: u16) -> Result<BoxedStream, ProxyError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::Transport(format!("websocket dial failed: {e}")))?;
    let _ = tcp.set_nodelay(true);

    if scheme == "https" {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(super::transport::NoVerifier))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Internal("invalid SNI host".into()))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Transport(format!("websocket tls handshake failed: {e}")))?;
        Ok(Box::new(tls))
    } else {
        Ok(Box::new(tcp))
    }
}

/// Serializes the minimal HTTP/1.1 upgrade request line-by-line to the
/// upstream, preserving the original method, path, and headers.
async fn write_upgrade_request(
    stream: &mut BoxedStream,
    req: &Request<Incoming>,
    upstream_host: &str,
) -> Result<(), ProxyError> {
    let uri = req.uri();
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);
    out.push_str(&format!("Host: {upstream_host}\r\n"));
    for (name, value) in req.headers() {
        if name == http::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push_str(&format!("{}: {}\r\n", name.as_str(), v));
        }
    }
    out.push_str("\r\n");
    stream
        .write_all(out.as_bytes())
        .await
        .map_err(|e| ProxyError::Transport(format!("websocket upstream write failed: {e}")))
}

struct UpstreamHandshake {
    status_line: String,
    headers: HeaderMap,
}

/// Reads a single HTTP response head from `reader`, requiring `101`.
async fn read_upstream_handshake(
    reader: &mut BufReader<BoxedStream>,
) -> Result<UpstreamHandshake, ProxyError> {
    let mut status_line = String::new();
    read_line(reader, &mut status_line).await?;
    if !status_line.contains("101") {
        return Err(ProxyError::Transport(format!(
            "upstream refused websocket upgrade: {}",
            status_line.trim()
        )));
    }

    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        read_line(reader, &mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(name.trim().as_bytes()),
                http::HeaderValue::from_str(value.trim()),
            ) {
                headers.insert(name, value);
            }
        }
    }

    Ok(UpstreamHandshake { status_line, headers })
}

async fn read_line(
    reader: &mut BufReader<BoxedStream>,
    out: &mut String,
) -> Result<(), ProxyError> {
    use tokio::io::AsyncBufReadExt;
    reader
        .read_line(out)
        .await
        .map_err(|e| ProxyError::Transport(format!("websocket upstream read failed: {e}")))?;
    Ok(())
}

/// Full hijack+splice flow per §4.A. Call after the caller has already
/// validated `Upgrade: websocket` and route permission.
pub async fn hijack_and_splice(
    req: Request<Incoming>,
    upstream_scheme: &str,
    upstream_host: &str,
    upstream_port: u16,
    policy: &WebSocketPolicy,
    on_transfer: impl FnOnce(u64, u64) + Send + 'static,
) -> Result<(), ProxyError> {
    let mut upstream = dial_upstream(upstream_scheme, upstream_host, upstream_port).await?;
    write_upgrade_request(&mut upstream, &req, upstream_host).await?;
    let mut upstream_reader = BufReader::new(upstream);
    let handshake = read_upstream_handshake(&mut upstream_reader).await?;

    let client_upgraded: Upgraded = hyper::upgrade::on(req)
        .await
        .map_err(|e| ProxyError::Internal(format!("client hijack failed: {e}")))?;
    let mut client_io = TokioIo::new(client_upgraded);

    let mut response_head = handshake.status_line.clone();
    if !response_head.ends_with("\r\n") {
        response_head.push_str("\r\n");
    }
    for (name, value) in handshake.headers.iter() {
        if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
            continue;
        }
        if let Ok(v) = value.to_str() {
            response_head.push_str(&format!("{}: {}\r\n", name.as_str(), v));
        }
    }
    response_head.push_str("\r\n");
    client_io
        .write_all(response_head.as_bytes())
        .await
        .map_err(|e| ProxyError::Internal(format!("client hijack write failed: {e}")))?;

    let mut upstream_io = upstream_reader.into_inner();
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let deadline = Instant::now() + policy.max_duration;

    let bytes_up = Arc::new(AtomicU64::new(0));
    let bytes_down = Arc::new(AtomicU64::new(0));

    let splice_result = splice(
        &mut client_io,
        &mut upstream_io,
        last_activity.clone(),
        deadline,
        policy.idle_timeout,
        bytes_up.clone(),
        bytes_down.clone(),
    )
    .await;

    on_transfer(
        bytes_up.load(Ordering::Relaxed),
        bytes_down.load(Ordering::Relaxed),
    );

    splice_result
}

async fn splice(
    client: &mut (impl AsyncRead + AsyncWrite + Unpin),
    upstream: &mut BoxedStream,
    last_activity: Arc<Mutex<Instant>>,
    deadline: Instant,
    idle_timeout: Duration,
    bytes_up: Arc<AtomicU64>,
    bytes_down: Arc<AtomicU64>,
) -> Result<(), ProxyError> {
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut up_rd, mut up_wr) = tokio::io::split(upstream);

    let up_activity = last_activity.clone();
    let up_task = async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if up_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            bytes_up.fetch_add(n as u64, Ordering::Relaxed);
            *up_activity.lock().await = Instant::now();
        }
    };

    let down_activity = last_activity.clone();
    let down_task = async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match up_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if client_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            bytes_down.fetch_add(n as u64, Ordering::Relaxed);
            *down_activity.lock().await = Instant::now();
        }
    };

    let watchdog = async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if Instant::now() >= deadline {
                return;
            }
            let idle_for = last_activity.lock().await.elapsed();
            if idle_for >= idle_timeout {
                return;
            }
        }
    };

    tokio::select! {
        _ = up_task => {},
        _ = down_task => {},
        _ = watchdog => {},
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_rejects_above_limit() {
        let gauge = Arc::new(WebSocketGauge::new());
        let _g1 = gauge.try_acquire(1).unwrap();
        assert!(gauge.try_acquire(1).is_none());
    }

    #[test]
    fn gauge_releases_on_drop() {
        let gauge = Arc::new(WebSocketGauge::new());
        {
            let _g1 = gauge.try_acquire(1).unwrap();
        }
        assert!(gauge.try_acquire(1).is_some());
    }
}
