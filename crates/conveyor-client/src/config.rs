//! Client configuration types.

use std::time::Duration;

/// Reconnection backoff configuration.
///
/// After the n-th consecutive goodbye the client waits
/// `base * 2^(n-1)` (capped at `cap`) with `jitter` applied, before
/// reopening the connection.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Maximum delay between reconnect attempts.
    pub cap: Duration,
    /// Relative jitter in [0, 1]; 0.1 spreads deadlines by +/-10%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

/// Token-bucket limit on outgoing subscription requests.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens regenerated per second.
    pub tokens_per_second: f64,
    /// Bucket capacity.
    pub burst: u64,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client identifier; an 8-bit worker suffix is appended per worker.
    pub client_id: String,
    /// Number of worker threads. Each worker owns a disjoint slice of the
    /// subscription-ID space.
    pub num_workers: usize,
    /// Capacity of each cross-thread command queue.
    pub queue_size: usize,
    /// Cadence of the periodic per-worker tick.
    pub tick_interval: Duration,
    /// Reconnect schedule.
    pub backoff: BackoffConfig,
    /// Window within which duplicate unsubscribes for the same
    /// subscription are suppressed.
    pub unsubscribe_dedup_window: Duration,
    /// How often aggregated heartbeats are flushed to the server.
    pub heartbeat_period: Duration,
    /// Streams without a heartbeat for this long are reported unhealthy.
    pub heartbeat_timeout: Duration,
    /// Close a connection that has carried no streams for this long.
    pub connection_without_streams_keepalive: Duration,
    /// Optional rate limit on subscription requests.
    pub subscription_rate_limit: Option<RateLimitConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            num_workers: 1,
            queue_size: 4096,
            tick_interval: Duration::from_millis(100),
            backoff: BackoffConfig::default(),
            unsubscribe_dedup_window: Duration::from_millis(1000),
            heartbeat_period: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            connection_without_streams_keepalive: Duration::from_secs(30),
            subscription_rate_limit: None,
        }
    }
}

impl ClientConfig {
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }
}
