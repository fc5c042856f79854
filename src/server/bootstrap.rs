use crate::config::ProxyConfig;
use crate::control_plane::{self, ControlPlaneContext};
use crate::server::data_plane::{make_http1_dispatch, make_http3_dispatch};
use crate::server::state::ProxyState;
use crate::{server, tls};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
}

/// Proxy lifecycle: init → load config → wire state → serve → shutdown.
///
/// Unlike the teacher's etcd-backed gateway, there is no discovery or
/// registration phase here: routes and backends only ever enter through the
/// control-plane session protocol, so startup just needs to stand up the
/// listeners and hand each a shared `ProxyState`.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = ProxyConfig::load(&args.config_path)?;
    let state = ProxyState::new(config);
    state.cert_store.update_certificates(&state.config.certificates)?;

    let shutdown = Arc::new(Notify::new());

    let ctx = ControlPlaneContext {
        table: state.routes.clone(),
        registry: state.sessions.clone(),
        maintenance: state.maintenance.clone(),
        health: state.health.clone(),
        reconnect_timeout: state.reconnect_timeout(),
        grace_sweep_interval: std::time::Duration::from_secs(state.config.grace_sweeper_interval_secs),
        staged_sweep_interval: std::time::Duration::from_secs(state.config.staged_sweeper_interval_secs),
    };
    control_plane::spawn_sweeper(ctx.clone(), shutdown.clone());
    let control_handle = tokio::spawn({
        let listen = state.config.control_listen.clone();
        let shutdown = shutdown.clone();
        async move { control_plane::run(&listen, ctx, shutdown).await }
    });

    let redirect_handle = tokio::spawn({
        let listen = state.config.http_listen.clone();
        let shutdown = shutdown.clone();
        async move { tls::run_http_redirect(&listen, shutdown).await }
    });

    let https_handle = tokio::spawn({
        let listen = state.config.https_listen.clone();
        let cert_store = state.cert_store.clone();
        let dispatch = make_http1_dispatch(Arc::new(state.clone()));
        let shutdown = shutdown.clone();
        async move { tls::run_https(&listen, cert_store, dispatch, shutdown).await }
    });

    let http3_handle = state.config.http3_listen.clone().map(|listen| {
        let cert_store = state.cert_store.clone();
        let dispatch = make_http3_dispatch(Arc::new(state.clone()));
        let shutdown = shutdown.clone();
        tokio::spawn(async move { tls::run_http3(&listen, cert_store, dispatch, shutdown).await })
    });

    let admin_handle = tokio::spawn({
        let listen = state.config.admin_listen.clone();
        let state = state.clone();
        async move { server::run_admin_server(&listen, state).await }
    });

    tracing::info!(
        https = %state.config.https_listen,
        control = %state.config.control_listen,
        admin = %state.config.admin_listen,
        "server: relaykeep started"
    );

    wait_for_shutdown(&shutdown).await;

    let grace = std::time::Duration::from_secs(state.config.graceful_shutdown_secs);
    let teardown = async {
        let _ = control_handle.await;
        let _ = redirect_handle.await;
        let _ = https_handle.await;
        if let Some(h) = http3_handle {
            let _ = h.await;
        }
        let _ = admin_handle.await;
    };
    if tokio::time::timeout(grace, teardown).await.is_err() {
        tracing::warn!("server: graceful shutdown timed out after {}s", grace.as_secs());
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// Line buffer depth for the non-blocking writer before it starts dropping
/// (`lossy`) rather than applying backpressure to request handlers.
const LOG_BUFFER_LINES: usize = 128_000;

/// Default filter when `RUST_LOG` isn't set: info everywhere, plus debug for
/// our own crate since that's almost always what you want while triaging a
/// route/session issue in production.
const DEFAULT_LOG_FILTER: &str = "info,relaykeep=debug";

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(LOG_BUFFER_LINES)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
                .json(),
        )
        .init();

    // The non-blocking writer's worker thread lives as long as this guard;
    // the process only exits via signal handling in `wait_for_shutdown`, so
    // there's no scope to return it through — leak it for the process lifetime.
    std::mem::forget(guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
