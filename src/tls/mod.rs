pub mod cert_store;

pub use cert_store::CertStore;

use crate::backend::compression::AnyBody;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Per-request handler the HTTP/1.1+2 data plane supplies; TLS/accept-loop
/// plumbing never looks inside a request, it only owns the transport.
pub type DispatchFn = Arc<
    dyn Fn(Request<Incoming>, SocketAddr) -> Pin<Box<dyn Future<Output = Result<Response<AnyBody>, Infallible>> + Send>>
        + Send
        + Sync,
>;

/// HTTP/3 variant: h3/quinn never produces a hyper `Incoming` body, so the
/// front door fully buffers each request and hands the data-plane dispatcher
/// an already-boxed body instead.
pub type Http3DispatchFn = Arc<
    dyn Fn(Request<AnyBody>, SocketAddr) -> Pin<Box<dyn Future<Output = Result<Response<AnyBody>, Infallible>> + Send>>
        + Send
        + Sync,
>;

fn empty_body() -> AnyBody {
    Empty::new().map_err(|never: std::convert::Infallible| match never {}).boxed()
}

/// Unconditionally 301-redirects every request to `https://host/uri`.
pub async fn run_http_redirect(listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "tls: http redirect listening");

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => return Ok(()),
        };
        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "tls: redirect accept failed");
                continue;
            }
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = hyper::service::service_fn(|req: Request<Incoming>| async move {
                let host = req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
                let uri = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/").to_string();
                let location = format!("https://{host}{uri}");
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(http::StatusCode::MOVED_PERMANENTLY)
                        .header(http::header::LOCATION, location)
                        .body(empty_body())
                        .unwrap(),
                )
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new()).http1().serve_connection(io, svc).await {
                if !e.to_string().contains("connection closed") {
                    error!(error = %e, "tls: redirect connection error");
                }
            }
        });
    }
}

/// HTTP/1.1 + HTTP/2 (ALPN-negotiated) over TLS 1.2+.
pub async fn run_https(
    listen: &str,
    cert_store: Arc<CertStore>,
    dispatch: DispatchFn,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_store);
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    info!(%addr, "tls: https listening");

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => return Ok(()),
        };
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "tls: https accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let dispatch = dispatch.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%peer, error = %e, "tls: handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                let dispatch = dispatch.clone();
                async move { dispatch(req, peer).await }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(%peer, error = %e, "tls: https connection error");
                }
            }
        });
    }
}

/// HTTP/3 over QUIC on the same host:port (UDP). Kept intentionally thin:
/// one task per connection, one task per request stream, no push/trailers.
pub async fn run_http3(
    listen: &str,
    cert_store: Arc<CertStore>,
    dispatch: Http3DispatchFn,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_store);
    server_config.alpn_protocols = vec![b"h3".to_vec()];
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_config)
        .map_err(|e| anyhow::anyhow!("tls: invalid quic server config: {e}"))?;
    let quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    let endpoint = quinn::Endpoint::server(quic_server_config, addr)?;

    info!(%addr, "tls: http3 listening");

    loop {
        let accepted = tokio::select! {
            result = endpoint.accept() => result,
            _ = shutdown.notified() => {
                endpoint.close(0u32.into(), b"shutdown");
                return Ok(());
            }
        };
        let Some(incoming) = accepted else { return Ok(()) };
        let dispatch = dispatch.clone();

        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "tls: http3 handshake failed");
                    return;
                }
            };
            let peer = conn.remote_address();
            let mut h3_conn = match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(%peer, error = %e, "tls: http3 connection setup failed");
                    return;
                }
            };

            loop {
                match h3_conn.accept().await {
                    Ok(Some((req, stream))) => {
                        let dispatch = dispatch.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_h3_request(req, stream, peer, dispatch).await {
                                warn!(%peer, error = %e, "tls: http3 request failed");
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%peer, error = %e, "tls: http3 accept failed");
                        break;
                    }
                }
            }
        });
    }
}

async fn serve_h3_request<T>(
    req: Request<()>,
    mut stream: h3::server::RequestStream<T, Bytes>,
    peer: SocketAddr,
    dispatch: Http3DispatchFn,
) -> anyhow::Result<()>
where
    T: h3::quic::BidiStream<Bytes>,
{
    let mut buffered = Vec::new();
    while let Some(chunk) = stream.recv_data().await? {
        buffered.extend_from_slice(chunk.chunk());
    }
    let (parts, ()) = req.into_parts();
    let boxed_body: AnyBody = http_body_util::Full::new(Bytes::from(buffered))
        .map_err(|never| match never {})
        .boxed();
    let request = Request::from_parts(parts, boxed_body);

    let response = dispatch(request, peer).await;
    let response = response.unwrap_or_else(|_| Response::builder().status(500).body(empty_body()).unwrap());

    let (parts, body) = response.into_parts();
    stream.send_response(Response::from_parts(parts, ())).await?;
    let collected = body.collect().await?.to_bytes();
    stream.send_data(collected).await?;
    stream.finish().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_has_no_bytes() {
        // Smoke test: constructing the shared empty body must not panic.
        let _ = empty_body();
    }
}
