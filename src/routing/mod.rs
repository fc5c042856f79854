pub mod rate_limit;
pub mod route;
pub mod table;

pub use route::{
    CircuitBreakerParams, DrainState, HeaderOp, HeaderOpAction, HealthCheckSpec, RateLimitSpec,
    Route, RouteSummary,
};
pub use table::RouteTable;
