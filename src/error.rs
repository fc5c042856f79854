use std::fmt;

/// Error taxonomy shared by the control-plane session handler and the
/// data-plane dispatcher. Each variant maps to exactly one wire-level or
/// HTTP-level outcome so that the mapping lives in one place instead of
/// being re-derived at every call site.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed command, wrong arg count, unknown session, invalid JSON.
    Protocol(String),
    /// Empty domains, empty path, backend URL missing `://`, etc.
    Validation(String),
    /// DNS/connect/read failure while talking to a backend.
    Transport(String),
    /// Backend responded with status >= 500.
    UpstreamServer(u16),
    /// Circuit breaker is open for this backend.
    CircuitOpen,
    /// Backend marked unhealthy by active health checks.
    Unhealthy,
    /// Route is draining and this request lost the ramp roll.
    Draining,
    /// No route matched; caller should hijack and close without a response.
    Blackhole,
    /// WebSocket `max_connections` reached.
    Capacity,
    /// Route's `RATELIMIT_SET` window/count was exceeded.
    RateLimited,
    /// Programmer/internal error (hijack unsupported, etc).
    Internal(String),
    /// Unrecoverable startup error.
    Fatal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Protocol(msg) => write!(f, "{}", msg),
            ProxyError::Validation(msg) => write!(f, "{}", msg),
            ProxyError::Transport(msg) => write!(f, "transport error: {}", msg),
            ProxyError::UpstreamServer(status) => write!(f, "upstream server error: {}", status),
            ProxyError::CircuitOpen => write!(f, "circuit breaker open"),
            ProxyError::Unhealthy => write!(f, "backend unhealthy"),
            ProxyError::Draining => write!(f, "route draining"),
            ProxyError::Blackhole => write!(f, "no route matched"),
            ProxyError::Capacity => write!(f, "capacity exceeded"),
            ProxyError::RateLimited => write!(f, "rate limit exceeded"),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
            ProxyError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// HTTP status this error maps to when surfaced to a data-plane client.
    /// `None` means "no HTTP response at all" (blackhole).
    pub fn status_code(&self) -> Option<http::StatusCode> {
        use http::StatusCode;
        match self {
            ProxyError::Transport(_) => Some(StatusCode::BAD_GATEWAY),
            ProxyError::UpstreamServer(_) => Some(StatusCode::BAD_GATEWAY),
            ProxyError::CircuitOpen | ProxyError::Unhealthy | ProxyError::Draining => {
                Some(StatusCode::SERVICE_UNAVAILABLE)
            }
            ProxyError::Blackhole => None,
            ProxyError::Capacity => Some(StatusCode::SERVICE_UNAVAILABLE),
            ProxyError::RateLimited => Some(StatusCode::TOO_MANY_REQUESTS),
            ProxyError::Internal(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            ProxyError::Protocol(_) | ProxyError::Validation(_) => {
                Some(StatusCode::BAD_REQUEST)
            }
            ProxyError::Fatal(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// `ERROR|<reason>` wire-line payload for the control-plane protocol.
    pub fn wire_reason(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blackhole_has_no_status() {
        assert_eq!(ProxyError::Blackhole.status_code(), None);
    }

    #[test]
    fn circuit_open_is_503() {
        assert_eq!(
            ProxyError::CircuitOpen.status_code(),
            Some(http::StatusCode::SERVICE_UNAVAILABLE)
        );
    }
}
