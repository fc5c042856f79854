pub mod maintenance;
pub mod protocol;
pub mod registry;
pub mod session;

use crate::collaborators::HealthChecker;
use crate::control_plane::maintenance::MaintenanceWorkers;
use crate::control_plane::protocol::{error_line, ok, ok_with, Command};
use crate::control_plane::registry::SessionRegistry;
use crate::control_plane::session::Session;
use crate::error::ProxyError;
use crate::ids::next_session_id;
use crate::routing::route::HeaderOpAction;
use crate::routing::RouteTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Shared context every connection handler and the sweeper task needs.
#[derive(Clone)]
pub struct ControlPlaneContext {
    pub table: Arc<RouteTable>,
    pub registry: Arc<SessionRegistry>,
    pub maintenance: Arc<MaintenanceWorkers>,
    pub health: Arc<dyn HealthChecker>,
    pub reconnect_timeout: Duration,
    /// Tick period for reaping stale staged-config TTLs and sweeping sessions
    /// past their reconnect grace period.
    pub grace_sweep_interval: Duration,
    /// Tick period for the slower staged-map expiry sweep.
    pub staged_sweep_interval: Duration,
}

pub async fn run(listen: &str, ctx: ControlPlaneContext, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control_plane: listening");

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("control_plane: stop accepting new connections");
                return Ok(());
            }
        };

        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "control_plane: accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                debug!(%peer, error = %e, "control_plane: connection ended");
            }
        });
    }
}

/// Keeps `relaykeep_connections_active` in sync with live control-plane TCP
/// connections regardless of which path out of `handle_connection` is taken.
struct ConnectionGuard;

impl ConnectionGuard {
    fn new() -> Self {
        metrics::gauge!("relaykeep_connections_active").increment(1.0);
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::gauge!("relaykeep_connections_active").decrement(1.0);
    }
}

async fn handle_connection(stream: TcpStream, ctx: ControlPlaneContext) -> anyhow::Result<()> {
    let _connection_guard = ConnectionGuard::new();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let mut bound_session: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        tokio::select! {
            n = reader.read_line(&mut line) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                let response = dispatch_line(trimmed, &ctx, &outbound_tx, &mut bound_session).await;
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            Some(event) = outbound_rx.recv() => {
                writer.write_all(event.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }
    }

    if let Some(session_id) = bound_session {
        ctx.registry.on_disconnect(&session_id, &ctx.table);
        ctx.maintenance.cancel_session(&session_id);
    }
    Ok(())
}

async fn dispatch_line(
    line: &str,
    ctx: &ControlPlaneContext,
    outbound_tx: &mpsc::UnboundedSender<String>,
    bound_session: &mut Option<String>,
) -> String {
    let command = match Command::parse(line) {
        Ok(c) => c,
        Err(e) => return error_line(&e),
    };

    match dispatch_command(command, ctx, outbound_tx, bound_session).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "control_plane: command failed");
            error_line(&e)
        }
    }
}

fn find_session(ctx: &ControlPlaneContext, session_id: &str) -> Result<Arc<Session>, ProxyError> {
    ctx.registry.get(session_id).ok_or_else(|| ProxyError::Protocol(format!("unknown session: {session_id}")))
}

async fn dispatch_command(
    command: Command,
    ctx: &ControlPlaneContext,
    outbound_tx: &mpsc::UnboundedSender<String>,
    bound_session: &mut Option<String>,
) -> Result<String, ProxyError> {
    metrics::counter!("relaykeep_control_plane_commands_total", "command" => command.name()).increment(1);

    match command {
        Command::Register { service, instance, maint_port, metadata_json } => {
            let session_id = next_session_id();
            let session = Session::new(session_id.clone(), service, instance, maint_port, metadata_json);
            ctx.registry.register(session, outbound_tx.clone(), &ctx.table, ctx.health.as_ref());
            *bound_session = Some(session_id.clone());
            Ok(ok_with("ACK", &session_id))
        }

        Command::Reconnect { session_id } => match ctx.registry.get(&session_id) {
            Some(_) => {
                ctx.registry.set_outbound(&session_id, outbound_tx.clone());
                ctx.registry.on_reconnect(&session_id, &ctx.table);
                *bound_session = Some(session_id);
                Ok(ok("OK"))
            }
            None => Ok("REREGISTER".to_string()),
        },

        Command::Ping { session_id } => {
            let session = find_session(ctx, &session_id)?;
            session.touch();
            Ok(ok("PONG"))
        }

        Command::RouteAdd { session_id, domains_csv, path, url, priority } => {
            let session = find_session(ctx, &session_id)?;
            let route_id = session.stage_route_add(&domains_csv, &path, &url, priority)?;
            Ok(ok_with("ROUTE_OK", &route_id))
        }

        Command::RouteAddBulk { session_id, json_array } => {
            let session = find_session(ctx, &session_id)?;
            let entries: Vec<serde_json::Value> = serde_json::from_str(&json_array)
                .map_err(|e| ProxyError::Validation(format!("ROUTE_ADD_BULK: invalid json: {e}")))?;
            let mut ids = Vec::with_capacity(entries.len());
            for entry in &entries {
                let domains = entry.get("domains").and_then(|v| v.as_str()).unwrap_or_default();
                let path = entry.get("path").and_then(|v| v.as_str()).unwrap_or_default();
                let url = entry.get("url").and_then(|v| v.as_str()).unwrap_or_default();
                let priority = entry.get("priority").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
                ids.push(session.stage_route_add(domains, path, url, priority)?);
            }
            Ok(ok_with("ROUTE_BULK_OK", &serde_json::to_string(&ids).unwrap_or_default()))
        }

        Command::RouteUpdate { session_id, route_id, field, value } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_route_update(&route_id, &field, &value)?;
            Ok(ok("ROUTE_OK"))
        }

        Command::RouteRemove { session_id, route_id } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_route_remove(&route_id);
            Ok(ok("ROUTE_OK"))
        }

        Command::RouteList { session_id } => {
            let session = find_session(ctx, &session_id)?;
            let active_ids = session.active_route_ids();
            let summaries = ctx.table.route_summaries();
            let mine: Vec<_> = summaries.into_iter().filter(|s| active_ids.contains(&s.route_id)).collect();
            Ok(ok_with("ROUTE_LIST_OK", &serde_json::to_string(&mine).unwrap_or_default()))
        }

        Command::HeadersSet { session_id, name, value } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_header(&name, value, HeaderOpAction::Set);
            Ok(ok("HEADERS_OK"))
        }

        Command::HeadersRemove { session_id, name } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_header(&name, None, HeaderOpAction::Remove);
            Ok(ok("HEADERS_OK"))
        }

        Command::OptionsSet { session_id, key, value } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_option(&key, &value);
            Ok(ok("OPTIONS_OK"))
        }

        Command::OptionsRemove { session_id, key } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_option(&key, "");
            Ok(ok("OPTIONS_OK"))
        }

        Command::HealthSet { session_id, route_id, path, interval_secs, timeout_secs } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_health(&route_id, &path, interval_secs, timeout_secs);
            Ok(ok("HEALTH_OK"))
        }

        Command::RatelimitSet { session_id, route_id, requests, window_secs } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_ratelimit(&route_id, requests, window_secs);
            Ok(ok("RATELIMIT_OK"))
        }

        Command::CircuitBreakerSet { session_id, route_id, field, value } => {
            let session = find_session(ctx, &session_id)?;
            session.stage_circuit_breaker(&route_id, &field, &value)?;
            Ok(ok("CIRCUIT_OK"))
        }

        Command::CircuitBreakerStatus { session_id, route_id } => {
            let _session = find_session(ctx, &session_id)?;
            let route = ctx.table.route_summaries().into_iter().find(|r| r.route_id == route_id);
            let backend_url = route.map(|r| r.backend_url);
            let state = backend_url.as_deref().and_then(|u| ctx.table.find_backend(u)).map(|b| b.circuit_state().to_string());
            Ok(ok_with("CIRCUIT_STATUS_OK", &serde_json::json!({ "route_id": route_id, "state": state }).to_string()))
        }

        Command::CircuitBreakerReset { session_id, route_id } => {
            let _session = find_session(ctx, &session_id)?;
            let route = ctx.table.route_summaries().into_iter().find(|r| r.route_id == route_id);
            if let Some(backend) = route.and_then(|r| ctx.table.find_backend(&r.backend_url)) {
                backend.reset_circuit();
            }
            Ok(ok("CIRCUIT_OK"))
        }

        Command::ConfigValidate { session_id } => {
            let session = find_session(ctx, &session_id)?;
            session.validate_staged()?;
            Ok(ok("OK"))
        }

        Command::ConfigApply { session_id } => {
            let session = find_session(ctx, &session_id)?;
            session.apply(&ctx.table, &[], ctx.health.as_ref())?;
            Ok(ok("OK"))
        }

        Command::ConfigApplyPartial { session_id, scope_csv } => {
            let session = find_session(ctx, &session_id)?;
            let scopes: Vec<&str> = scope_csv.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
            session.apply(&ctx.table, &scopes, ctx.health.as_ref())?;
            Ok(ok("OK"))
        }

        Command::ConfigRollback { session_id } => {
            let session = find_session(ctx, &session_id)?;
            session.rollback();
            Ok(ok("OK"))
        }

        Command::ConfigDiff { session_id } => {
            let session = find_session(ctx, &session_id)?;
            Ok(ok_with("DIFF_OK", &serde_json::to_string(&session.diff()).unwrap_or_default()))
        }

        Command::BackendTest { session_id, url } => {
            let _session = find_session(ctx, &session_id)?;
            match test_backend(&url).await {
                Ok(status) => Ok(ok_with("BACKEND_OK", &status.to_string())),
                Err(e) => Ok(format!("BACKEND_FAIL|{e}")),
            }
        }

        Command::DrainStart { session_id, duration_secs } => {
            let session = find_session(ctx, &session_id)?;
            let duration = Duration::from_secs(duration_secs.unwrap_or(30));
            session.start_drain(duration);
            for route_id in session.active_route_ids() {
                let _ = ctx.table.start_drain(&route_id, duration);
            }
            Ok(ok("DRAIN_OK"))
        }

        Command::DrainStatus { session_id } => {
            let session = find_session(ctx, &session_id)?;
            let p = session.drain_status().unwrap_or(0.0);
            Ok(ok_with("DRAIN_OK", &p.to_string()))
        }

        Command::DrainCancel { session_id } => {
            let session = find_session(ctx, &session_id)?;
            session.cancel_drain();
            for route_id in session.active_route_ids() {
                let _ = ctx.table.cancel_drain(&route_id);
            }
            Ok(ok("DRAIN_OK"))
        }

        Command::MaintEnter { session_id, target, page_url } => {
            let session = find_session(ctx, &session_id)?;
            let targets = session.set_maintenance(&target, true, Some(page_url.clone()));
            for route_id in &targets {
                let _ = ctx.table.set_maintenance(route_id, true, Some(page_url.clone()));
            }
            for route_id in &targets {
                ctx.maintenance.start_verify(ctx.registry.clone(), session_id.clone(), route_id.clone(), page_url.clone());
            }
            Ok(ok("ACK"))
        }

        Command::MaintExit { session_id, target } => {
            let session = find_session(ctx, &session_id)?;
            let targets = session.set_maintenance(&target, false, None);
            let summaries = ctx.table.route_summaries();
            for route_id in &targets {
                let _ = ctx.table.set_maintenance(route_id, false, None);
                let backend_url = summaries.iter().find(|r| &r.route_id == route_id).map(|r| r.backend_url.clone());
                if let Some(backend_url) = backend_url {
                    ctx.maintenance.start_verify(ctx.registry.clone(), session_id.clone(), route_id.clone(), backend_url);
                } else {
                    ctx.maintenance.cancel(&session_id, route_id);
                }
            }
            Ok(ok("ACK"))
        }

        Command::MaintStatus { session_id } => {
            let session = find_session(ctx, &session_id)?;
            Ok(ok_with("MAINT_STATUS_OK", &serde_json::to_string(&session.maintenance_route_ids()).unwrap_or_default()))
        }

        Command::Subscribe { session_id, event_type } => {
            let session = find_session(ctx, &session_id)?;
            session.subscribe(&event_type);
            Ok(ok("SUBSCRIBE_OK"))
        }

        Command::Unsubscribe { session_id, event_type } => {
            let session = find_session(ctx, &session_id)?;
            session.unsubscribe(&event_type);
            Ok(ok("UNSUBSCRIBE_OK"))
        }

        Command::ClientShutdown { session_id } => {
            let session = find_session(ctx, &session_id)?;
            for route_id in session.active_route_ids() {
                ctx.table.remove_route(&route_id);
            }
            ctx.registry.remove(&session_id, &ctx.table, ctx.health.as_ref());
            ctx.maintenance.cancel_session(&session_id);
            *bound_session = None;
            Ok(ok("SHUTDOWN_OK"))
        }
    }
}

async fn test_backend(url: &str) -> Result<u16, ProxyError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    let resp = client.get(url).send().await.map_err(|e| ProxyError::Transport(e.to_string()))?;
    Ok(resp.status().as_u16())
}

/// Two independent tickers: the fast one (`grace_sweep_interval`, default 5s)
/// sweeps sessions past their reconnect grace period and reaps expired
/// drains; the slow one (`staged_sweep_interval`, default 5min) reaps staged
/// config mutations whose TTL lapsed without a CONFIG_APPLY.
pub fn spawn_sweeper(ctx: ControlPlaneContext, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let mut grace_ticker = tokio::time::interval(ctx.grace_sweep_interval);
        let mut staged_ticker = tokio::time::interval(ctx.staged_sweep_interval);
        loop {
            tokio::select! {
                _ = grace_ticker.tick() => {
                    ctx.registry.sweep_expired(ctx.reconnect_timeout, &ctx.table, ctx.health.as_ref());
                    ctx.table.reap_expired_drains();
                }
                _ = staged_ticker.tick() => {
                    ctx.registry.sweep_staged();
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}
