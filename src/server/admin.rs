use crate::server::state::ProxyState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn handle_admin(req: Request<Incoming>, state: ProxyState) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder().status(200).body(full_body(r#"{"status":"ok"}"#)).unwrap()),

        "/ready" | "/readyz" => {
            let routes = state.routes.route_summaries();
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","routes":{},"sessions":{}}}"#,
                    routes.len(),
                    state.sessions.session_count(),
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics_registry.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let routes = state.routes.route_summaries();
            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder().status(200).header("content-type", "application/json").body(full_body(body)).unwrap())
        }

        "/sessions" => {
            let sessions = state.sessions.session_summaries();
            let body = serde_json::to_string_pretty(&sessions).unwrap_or_default();
            Ok(Response::builder().status(200).header("content-type", "application/json").body(full_body(body)).unwrap())
        }

        "/backends" => {
            let statuses = state.routes.backend_statuses();
            let body: Vec<serde_json::Value> = statuses
                .into_iter()
                .map(|(url, healthy, circuit)| serde_json::json!({"url": url, "healthy": healthy, "circuit": circuit}))
                .collect();
            let body = serde_json::to_string_pretty(&body).unwrap_or_default();
            Ok(Response::builder().status(200).header("content-type", "application/json").body(full_body(body)).unwrap())
        }

        _ => Ok(Response::builder().status(404).body(full_body(r#"{"error":"not found"}"#)).unwrap()),
    }
}
