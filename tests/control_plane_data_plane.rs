//! End-to-end scenarios driven over the real control-plane wire protocol
//! (a raw TCP client speaking `|`-delimited lines) against a local HTTP echo
//! backend, replacing the teacher's consul/etcd integration fixtures.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use relaykeep::backend::compression::AnyBody;
use relaykeep::config::ProxyConfig;
use relaykeep::control_plane::{self, ControlPlaneContext};
use relaykeep::server::data_plane::make_http3_dispatch;
use relaykeep::server::ProxyState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

async fn spawn_echo_backend(addr: &str) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(|req: Request<Incoming>| async move {
                    let host = req.headers().get(http::header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(host))))
                });
                let _ = auto::Builder::new(TokioExecutor::new()).http1().serve_connection(io, svc).await;
            });
        }
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
}

fn spawn_control_plane(listen: &'static str, state: &ProxyState) -> Arc<Notify> {
    let shutdown = Arc::new(Notify::new());
    let ctx = ControlPlaneContext {
        table: state.routes.clone(),
        registry: state.sessions.clone(),
        maintenance: state.maintenance.clone(),
        health: state.health.clone(),
        reconnect_timeout: std::time::Duration::from_millis(200),
        grace_sweep_interval: std::time::Duration::from_millis(50),
        staged_sweep_interval: std::time::Duration::from_secs(300),
    };
    let s = shutdown.clone();
    tokio::spawn(async move { control_plane::run(listen, ctx, s).await });
    shutdown
}

async fn connect(listen: &str) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let stream = TcpStream::connect(listen).await.unwrap();
    let (r, w) = stream.into_split();
    (BufReader::new(r), w)
}

async fn send_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line.trim_end_matches(['\n', '\r']).to_string()
}

async fn dispatch_request(state: &ProxyState, host: &str, path: &str) -> Response<AnyBody> {
    let dispatch = make_http3_dispatch(Arc::new(state.clone()));
    let body: AnyBody = Empty::new().map_err(|never: std::convert::Infallible| match never {}).boxed();
    let req = Request::builder().method("GET").uri(path).header("host", host).body(body).unwrap();
    let peer = SocketAddr::new(relaykeep::collaborators::loopback(), 1);
    dispatch(req, peer).await.unwrap()
}

#[tokio::test]
async fn s1_register_route_apply_and_proxy() {
    spawn_echo_backend("127.0.0.1:19190").await;
    let state = ProxyState::new(ProxyConfig::default());
    let _shutdown = spawn_control_plane("127.0.0.1:19181", &state);
    let (mut r, mut w) = connect("127.0.0.1:19181").await;

    send_line(&mut w, "REGISTER|svc-a|inst-1|9100|{}").await;
    let ack = read_line(&mut r).await;
    assert!(ack.starts_with("ACK|"));
    let session_id = ack.split('|').nth(1).unwrap().to_string();

    send_line(&mut w, &format!("ROUTE_ADD|{session_id}|svc-a.example.com|/api|http://127.0.0.1:19190|0")).await;
    let route_resp = read_line(&mut r).await;
    assert!(route_resp.starts_with("ROUTE_OK|"));

    send_line(&mut w, &format!("CONFIG_APPLY|{session_id}")).await;
    assert_eq!(read_line(&mut r).await, "OK");

    assert!(state.routes.find_route("svc-a.example.com", "/api").is_some());

    let resp = dispatch_request(&state, "svc-a.example.com", "/api/hello").await;
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    // The outbound Host header must carry the backend's authority
    // (host:port), not the original inbound Host the client sent.
    assert_eq!(&body[..], b"127.0.0.1:19190");
}

#[tokio::test]
async fn s3_disconnect_disables_then_reconnect_enables_route() {
    let state = ProxyState::new(ProxyConfig::default());
    let _shutdown = spawn_control_plane("127.0.0.1:19182", &state);
    let (mut r, mut w) = connect("127.0.0.1:19182").await;

    send_line(&mut w, "REGISTER|svc-b|inst-1|9100|{}").await;
    let session_id = read_line(&mut r).await.split('|').nth(1).unwrap().to_string();
    send_line(&mut w, &format!("ROUTE_ADD|{session_id}|svc-b.example.com|/api|http://127.0.0.1:19191|0")).await;
    read_line(&mut r).await;
    send_line(&mut w, &format!("CONFIG_APPLY|{session_id}")).await;
    read_line(&mut r).await;
    assert!(state.routes.find_route("svc-b.example.com", "/api").is_some());

    drop(w);
    drop(r);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Route disabled: a blackhole response, not a matched route.
    let resp = dispatch_request(&state, "svc-b.example.com", "/api").await;
    assert_eq!(resp.status(), 444);
    assert!(state.routes.find_route("svc-b.example.com", "/api").is_none());

    let (mut r2, mut w2) = connect("127.0.0.1:19182").await;
    send_line(&mut w2, &format!("RECONNECT|{session_id}")).await;
    assert_eq!(read_line(&mut r2).await, "OK");
    assert!(state.routes.find_route("svc-b.example.com", "/api").is_some());
}

#[tokio::test]
async fn s5_reregister_retires_prior_session_routes() {
    let state = ProxyState::new(ProxyConfig::default());
    let _shutdown = spawn_control_plane("127.0.0.1:19183", &state);

    let (mut r1, mut w1) = connect("127.0.0.1:19183").await;
    send_line(&mut w1, "REGISTER|svc-c|inst-1|9100|{}").await;
    let session_a = read_line(&mut r1).await.split('|').nth(1).unwrap().to_string();
    send_line(&mut w1, &format!("ROUTE_ADD|{session_a}|svc-c.example.com|/api|http://127.0.0.1:19192|0")).await;
    read_line(&mut r1).await;
    send_line(&mut w1, &format!("CONFIG_APPLY|{session_a}")).await;
    read_line(&mut r1).await;
    assert!(state.routes.find_route("svc-c.example.com", "/api").is_some());

    let (mut r2, mut w2) = connect("127.0.0.1:19183").await;
    send_line(&mut w2, "REGISTER|svc-c|inst-1|9100|{}").await;
    let ack2 = read_line(&mut r2).await;
    assert!(ack2.starts_with("ACK|"));
    let session_b = ack2.split('|').nth(1).unwrap().to_string();
    assert_ne!(session_a, session_b);

    // Re-REGISTER retires the prior session's routes immediately.
    assert!(state.routes.find_route("svc-c.example.com", "/api").is_none());
    assert_eq!(state.sessions.session_count(), 1);
}
