//! Server configuration types.

use std::net::SocketAddr;
use std::time::Duration;

/// Rocketeer server configuration.
#[derive(Debug, Clone)]
pub struct RocketeerOptions {
    /// Address to listen on; port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Number of worker threads, one rocketeer each.
    pub num_workers: usize,
    /// Capacity of each worker command queue.
    pub queue_size: usize,
    /// Cadence of the periodic per-worker tick.
    pub tick_interval: Duration,
    /// How often aggregated heartbeats are flushed to clients.
    pub heartbeat_period: Duration,
    /// Streams without a heartbeat for this long are reported unhealthy.
    pub heartbeat_timeout: Duration,
    /// Close inbound sockets that have carried no streams for this long.
    pub connection_without_streams_keepalive: Duration,
}

impl Default for RocketeerOptions {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:58200".parse().expect("valid address"),
            num_workers: 1,
            queue_size: 4096,
            tick_interval: Duration::from_millis(100),
            heartbeat_period: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            connection_without_streams_keepalive: Duration::from_secs(30),
        }
    }
}

/// Log tailer configuration.
#[derive(Debug, Clone)]
pub struct LogTailerOptions {
    /// Number of storage readers to open.
    pub num_readers: usize,
    /// Probability in [0, 1] of artificially failing a forward from a
    /// storage callback, to exercise the storage retry path.
    pub forward_failure_probability: f64,
}

impl Default for LogTailerOptions {
    fn default() -> Self {
        Self {
            num_readers: 1,
            forward_failure_probability: 0.0,
        }
    }
}

/// Control room configuration.
#[derive(Debug, Clone)]
pub struct ControlRoomOptions {
    /// Capacity of the room command queue.
    pub queue_size: usize,
}

impl Default for ControlRoomOptions {
    fn default() -> Self {
        Self { queue_size: 4096 }
    }
}
