mod admin;
pub mod bootstrap;
pub mod data_plane;
pub mod runtime;
mod state;

pub use state::ProxyState;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Runs the plain-HTTP admin surface (health, readiness, metrics, route and
/// session introspection). Unlike the TLS front door this listener never
/// terminates client traffic, so it gets its own small accept loop rather
/// than sharing `tls::run_https`'s dispatch machinery.
pub async fn run_admin_server(listen: &str, state: ProxyState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
