use crate::error::ProxyError;

/// One parsed control-plane command line. All non-REGISTER commands carry
/// the session id as their first wire argument; `Command::parse` strips it
/// off and returns it alongside the variant so the session dispatcher
/// doesn't have to re-split strings per arm.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Register { service: String, instance: String, maint_port: u16, metadata_json: String },
    Reconnect { session_id: String },
    Ping { session_id: String },
    RouteAdd { session_id: String, domains_csv: String, path: String, url: String, priority: i32 },
    RouteAddBulk { session_id: String, json_array: String },
    RouteUpdate { session_id: String, route_id: String, field: String, value: String },
    RouteRemove { session_id: String, route_id: String },
    RouteList { session_id: String },
    HeadersSet { session_id: String, name: String, value: Option<String> },
    HeadersRemove { session_id: String, name: String },
    OptionsSet { session_id: String, key: String, value: String },
    OptionsRemove { session_id: String, key: String },
    HealthSet { session_id: String, route_id: String, path: String, interval_secs: u64, timeout_secs: u64 },
    RatelimitSet { session_id: String, route_id: String, requests: u64, window_secs: u64 },
    CircuitBreakerSet { session_id: String, route_id: String, field: String, value: String },
    CircuitBreakerStatus { session_id: String, route_id: String },
    CircuitBreakerReset { session_id: String, route_id: String },
    ConfigValidate { session_id: String },
    ConfigApply { session_id: String },
    ConfigApplyPartial { session_id: String, scope_csv: String },
    ConfigRollback { session_id: String },
    ConfigDiff { session_id: String },
    BackendTest { session_id: String, url: String },
    DrainStart { session_id: String, duration_secs: Option<u64> },
    DrainStatus { session_id: String },
    DrainCancel { session_id: String },
    MaintEnter { session_id: String, target: String, page_url: String },
    MaintExit { session_id: String, target: String },
    MaintStatus { session_id: String },
    Subscribe { session_id: String, event_type: String },
    Unsubscribe { session_id: String, event_type: String },
    ClientShutdown { session_id: String },
}

impl Command {
    /// Wire command name, for metrics labels and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register { .. } => "REGISTER",
            Command::Reconnect { .. } => "RECONNECT",
            Command::Ping { .. } => "PING",
            Command::RouteAdd { .. } => "ROUTE_ADD",
            Command::RouteAddBulk { .. } => "ROUTE_ADD_BULK",
            Command::RouteUpdate { .. } => "ROUTE_UPDATE",
            Command::RouteRemove { .. } => "ROUTE_REMOVE",
            Command::RouteList { .. } => "ROUTE_LIST",
            Command::HeadersSet { .. } => "HEADERS_SET",
            Command::HeadersRemove { .. } => "HEADERS_REMOVE",
            Command::OptionsSet { .. } => "OPTIONS_SET",
            Command::OptionsRemove { .. } => "OPTIONS_REMOVE",
            Command::HealthSet { .. } => "HEALTH_SET",
            Command::RatelimitSet { .. } => "RATELIMIT_SET",
            Command::CircuitBreakerSet { .. } => "CIRCUIT_BREAKER_SET",
            Command::CircuitBreakerStatus { .. } => "CIRCUIT_BREAKER_STATUS",
            Command::CircuitBreakerReset { .. } => "CIRCUIT_BREAKER_RESET",
            Command::ConfigValidate { .. } => "CONFIG_VALIDATE",
            Command::ConfigApply { .. } => "CONFIG_APPLY",
            Command::ConfigApplyPartial { .. } => "CONFIG_APPLY_PARTIAL",
            Command::ConfigRollback { .. } => "CONFIG_ROLLBACK",
            Command::ConfigDiff { .. } => "CONFIG_DIFF",
            Command::BackendTest { .. } => "BACKEND_TEST",
            Command::DrainStart { .. } => "DRAIN_START",
            Command::DrainStatus { .. } => "DRAIN_STATUS",
            Command::DrainCancel { .. } => "DRAIN_CANCEL",
            Command::MaintEnter { .. } => "MAINT_ENTER",
            Command::MaintExit { .. } => "MAINT_EXIT",
            Command::MaintStatus { .. } => "MAINT_STATUS",
            Command::Subscribe { .. } => "SUBSCRIBE",
            Command::Unsubscribe { .. } => "UNSUBSCRIBE",
            Command::ClientShutdown { .. } => "CLIENT_SHUTDOWN",
        }
    }

    /// Parses one `\n`-stripped, `|`-delimited wire line.
    pub fn parse(line: &str) -> Result<Command, ProxyError> {
        let mut fields = line.split('|');
        let name = fields.next().unwrap_or("").trim();
        let rest: Vec<&str> = fields.collect();

        macro_rules! need {
            ($n:expr) => {
                if rest.len() < $n {
                    return Err(ProxyError::Protocol(format!(
                        "{name}: expected at least {} arguments, got {}",
                        $n,
                        rest.len()
                    )));
                }
            };
        }

        Ok(match name {
            "REGISTER" => {
                need!(4);
                Command::Register {
                    service: rest[0].to_string(),
                    instance: rest[1].to_string(),
                    maint_port: rest[2].parse().map_err(|_| {
                        ProxyError::Protocol("REGISTER: invalid maint_port".into())
                    })?,
                    metadata_json: rest[3].to_string(),
                }
            }
            "RECONNECT" => {
                need!(1);
                Command::Reconnect { session_id: rest[0].to_string() }
            }
            "PING" => {
                need!(1);
                Command::Ping { session_id: rest[0].to_string() }
            }
            "ROUTE_ADD" => {
                need!(5);
                Command::RouteAdd {
                    session_id: rest[0].to_string(),
                    domains_csv: rest[1].to_string(),
                    path: rest[2].to_string(),
                    url: rest[3].to_string(),
                    priority: rest[4].parse().map_err(|_| {
                        ProxyError::Protocol("ROUTE_ADD: invalid priority".into())
                    })?,
                }
            }
            "ROUTE_ADD_BULK" => {
                need!(2);
                Command::RouteAddBulk { session_id: rest[0].to_string(), json_array: rest[1].to_string() }
            }
            "ROUTE_UPDATE" => {
                need!(4);
                Command::RouteUpdate {
                    session_id: rest[0].to_string(),
                    route_id: rest[1].to_string(),
                    field: rest[2].to_string(),
                    value: rest[3].to_string(),
                }
            }
            "ROUTE_REMOVE" => {
                need!(2);
                Command::RouteRemove { session_id: rest[0].to_string(), route_id: rest[1].to_string() }
            }
            "ROUTE_LIST" => {
                need!(1);
                Command::RouteList { session_id: rest[0].to_string() }
            }
            "HEADERS_SET" => {
                need!(3);
                Command::HeadersSet {
                    session_id: rest[0].to_string(),
                    name: rest[2].to_string(),
                    value: rest.get(3).map(|s| s.to_string()),
                }
            }
            "HEADERS_REMOVE" => {
                need!(3);
                Command::HeadersRemove { session_id: rest[0].to_string(), name: rest[2].to_string() }
            }
            "OPTIONS_SET" => {
                need!(4);
                Command::OptionsSet {
                    session_id: rest[0].to_string(),
                    key: rest[2].to_string(),
                    value: rest[3].to_string(),
                }
            }
            "OPTIONS_REMOVE" => {
                need!(3);
                Command::OptionsRemove { session_id: rest[0].to_string(), key: rest[2].to_string() }
            }
            "HEALTH_SET" => {
                need!(5);
                Command::HealthSet {
                    session_id: rest[0].to_string(),
                    route_id: rest[1].to_string(),
                    path: rest[2].to_string(),
                    interval_secs: rest[3].parse().unwrap_or(10),
                    timeout_secs: rest[4].parse().unwrap_or(3),
                }
            }
            "RATELIMIT_SET" => {
                need!(4);
                Command::RatelimitSet {
                    session_id: rest[0].to_string(),
                    route_id: rest[1].to_string(),
                    requests: rest[2].parse().map_err(|_| {
                        ProxyError::Protocol("RATELIMIT_SET: invalid requests".into())
                    })?,
                    window_secs: rest[3].parse().map_err(|_| {
                        ProxyError::Protocol("RATELIMIT_SET: invalid window".into())
                    })?,
                }
            }
            "CIRCUIT_BREAKER_SET" => {
                need!(4);
                Command::CircuitBreakerSet {
                    session_id: rest[0].to_string(),
                    route_id: rest[1].to_string(),
                    field: rest[2].to_string(),
                    value: rest[3].to_string(),
                }
            }
            "CIRCUIT_BREAKER_STATUS" => {
                need!(2);
                Command::CircuitBreakerStatus { session_id: rest[0].to_string(), route_id: rest[1].to_string() }
            }
            "CIRCUIT_BREAKER_RESET" => {
                need!(2);
                Command::CircuitBreakerReset { session_id: rest[0].to_string(), route_id: rest[1].to_string() }
            }
            "CONFIG_VALIDATE" => {
                need!(1);
                Command::ConfigValidate { session_id: rest[0].to_string() }
            }
            "CONFIG_APPLY" => {
                need!(1);
                Command::ConfigApply { session_id: rest[0].to_string() }
            }
            "CONFIG_APPLY_PARTIAL" => {
                need!(2);
                Command::ConfigApplyPartial { session_id: rest[0].to_string(), scope_csv: rest[1].to_string() }
            }
            "CONFIG_ROLLBACK" => {
                need!(1);
                Command::ConfigRollback { session_id: rest[0].to_string() }
            }
            "CONFIG_DIFF" => {
                need!(1);
                Command::ConfigDiff { session_id: rest[0].to_string() }
            }
            "BACKEND_TEST" => {
                need!(2);
                Command::BackendTest { session_id: rest[0].to_string(), url: rest[1].to_string() }
            }
            "DRAIN_START" => {
                need!(1);
                Command::DrainStart {
                    session_id: rest[0].to_string(),
                    duration_secs: rest.get(1).and_then(|s| s.parse().ok()),
                }
            }
            "DRAIN_STATUS" => {
                need!(1);
                Command::DrainStatus { session_id: rest[0].to_string() }
            }
            "DRAIN_CANCEL" => {
                need!(1);
                Command::DrainCancel { session_id: rest[0].to_string() }
            }
            "MAINT_ENTER" => {
                need!(3);
                Command::MaintEnter {
                    session_id: rest[0].to_string(),
                    target: rest[1].to_string(),
                    page_url: rest[2].to_string(),
                }
            }
            "MAINT_EXIT" => {
                need!(2);
                Command::MaintExit { session_id: rest[0].to_string(), target: rest[1].to_string() }
            }
            "MAINT_STATUS" => {
                need!(1);
                Command::MaintStatus { session_id: rest[0].to_string() }
            }
            "SUBSCRIBE" => {
                need!(2);
                Command::Subscribe { session_id: rest[0].to_string(), event_type: rest[1].to_string() }
            }
            "UNSUBSCRIBE" => {
                need!(2);
                Command::Unsubscribe { session_id: rest[0].to_string(), event_type: rest[1].to_string() }
            }
            "CLIENT_SHUTDOWN" => {
                need!(1);
                Command::ClientShutdown { session_id: rest[0].to_string() }
            }
            other => return Err(ProxyError::Protocol(format!("unknown command: {other}"))),
        })
    }
}

/// Formats a success/error reply line, without the trailing `\n` (the
/// session writer appends it).
pub fn ok(tag: &str) -> String {
    tag.to_string()
}

pub fn ok_with(tag: &str, payload: &str) -> String {
    format!("{tag}|{payload}")
}

pub fn error_line(err: &ProxyError) -> String {
    format!("ERROR|{}", err.wire_reason())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register() {
        let cmd = Command::parse("REGISTER|svc-a|inst-1|9100|{}").unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                service: "svc-a".into(),
                instance: "inst-1".into(),
                maint_port: 9100,
                metadata_json: "{}".into(),
            }
        );
    }

    #[test]
    fn parses_route_add() {
        let cmd = Command::parse("ROUTE_ADD|sess-1|example.com|/api|http://127.0.0.1:9000|10").unwrap();
        assert_eq!(
            cmd,
            Command::RouteAdd {
                session_id: "sess-1".into(),
                domains_csv: "example.com".into(),
                path: "/api".into(),
                url: "http://127.0.0.1:9000".into(),
                priority: 10,
            }
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Command::parse("NOT_A_COMMAND|x").is_err());
    }

    #[test]
    fn rejects_missing_arguments() {
        assert!(Command::parse("ROUTE_ADD|sess-1|example.com").is_err());
    }

    #[test]
    fn error_line_formats_reason() {
        let line = error_line(&ProxyError::Protocol("bad input".into()));
        assert_eq!(line, "ERROR|bad input");
    }
}
