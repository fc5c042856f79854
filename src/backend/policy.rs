use async_compression::Level as CompressionLevel;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryToken {
    ConnectionRefused,
    Timeout,
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub retry_on: Vec<RetryToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            retry_on: vec![
                RetryToken::ConnectionRefused,
                RetryToken::Timeout,
                RetryToken::Status(502),
                RetryToken::Status(503),
                RetryToken::Status(504),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Linear => self.initial_delay * attempt.max(1),
            Backoff::Exponential => self.initial_delay * 2u32.saturating_pow(attempt.saturating_sub(1)),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on.iter().any(|t| *t == RetryToken::Status(status))
    }

    pub fn should_retry_connect_failure(&self) -> bool {
        self.retry_on.contains(&RetryToken::ConnectionRefused)
    }

    pub fn should_retry_timeout(&self) -> bool {
        self.retry_on.contains(&RetryToken::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Brotli,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub algorithms: Vec<CompressionAlgorithm>,
    pub min_size: u64,
    pub content_types: Vec<String>,
    /// Compressor effort, shared across gzip and brotli. `Fastest` trades
    /// ratio for CPU, which matters more on a proxy's hot path than it would
    /// for a one-shot batch job.
    pub level: CompressionLevel,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithms: vec![CompressionAlgorithm::Brotli, CompressionAlgorithm::Gzip],
            min_size: 256,
            content_types: Vec::new(),
            level: CompressionLevel::Fastest,
        }
    }
}

impl CompressionPolicy {
    pub fn content_type_allowed(&self, content_type: &str) -> bool {
        self.content_types.is_empty()
            || self.content_types.iter().any(|p| content_type.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Collapsed to one pool per Backend, so `max_conns_per_host` coincides
    /// with the pool size.
    pub max_idle_conns: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub overall_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 64,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketPolicy {
    pub idle_timeout: Duration,
    pub max_duration: Duration,
    pub max_connections: u64,
}

impl Default for WebSocketPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_duration: Duration::from_secs(3600),
            max_connections: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowRequestThresholds {
    pub warning: Duration,
    pub critical: Duration,
    pub enabled: bool,
}

impl Default for SlowRequestThresholds {
    fn default() -> Self {
        Self {
            warning: Duration::from_secs(1),
            critical: Duration::from_secs(5),
            enabled: false,
        }
    }
}

/// Everything `update_policy(options)` can change on a live Backend.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub compression: CompressionPolicy,
    pub websocket: WebSocketPolicy,
    pub slow_request: SlowRequestThresholds,
    pub circuit_breaker: crate::config::CircuitBreakerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff: Backoff::Exponential,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Linear,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn retry_on_status_checks_membership() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry_status(503));
        assert!(!policy.should_retry_status(404));
    }

    #[test]
    fn content_type_allowed_empty_list_means_all() {
        let policy = CompressionPolicy::default();
        assert!(policy.content_type_allowed("application/json"));
    }

    #[test]
    fn content_type_allowed_respects_prefix_list() {
        let policy = CompressionPolicy {
            content_types: vec!["text/".to_string()],
            ..CompressionPolicy::default()
        };
        assert!(policy.content_type_allowed("text/html"));
        assert!(!policy.content_type_allowed("image/png"));
    }
}
