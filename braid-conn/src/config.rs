//! Connection configuration.

use std::time::Duration;

/// Default send rate limit in bytes per second (500 KB/s).
pub const DEFAULT_SEND_RATE: u64 = 512_000;

/// Default receive rate limit in bytes per second (500 KB/s).
pub const DEFAULT_RECV_RATE: u64 = 512_000;

/// Default maximum payload size of a single data packet.
pub const DEFAULT_MAX_PACKET_PAYLOAD_SIZE: usize = 1024;

/// Default maximum time a buffered byte may wait before a stream flush.
pub const DEFAULT_FLUSH_THROTTLE: Duration = Duration::from_millis(100);

/// Default interval between keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Default deadline for the peer to answer a ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(45);

/// Configuration for a multiplexed connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Outbound bandwidth cap in bytes per second, shared across channels.
    /// Zero disables the limit.
    pub send_rate: u64,

    /// Inbound bandwidth cap in bytes per second, shared across channels.
    /// Zero disables the limit.
    pub recv_rate: u64,

    /// Maximum payload bytes carried by one data packet. Messages larger
    /// than this are fragmented; the same bound is enforced on receive.
    pub max_packet_msg_payload_size: usize,

    /// Maximum time buffered output may sit unflushed.
    pub flush_throttle: Duration,

    /// Period between keepalive pings. Must be longer than `pong_timeout`.
    pub ping_interval: Duration,

    /// Maximum time from ping emission to pong arrival before the peer is
    /// declared dead.
    pub pong_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            send_rate: DEFAULT_SEND_RATE,
            recv_rate: DEFAULT_RECV_RATE,
            max_packet_msg_payload_size: DEFAULT_MAX_PACKET_PAYLOAD_SIZE,
            flush_throttle: DEFAULT_FLUSH_THROTTLE,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

impl ConnConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outbound rate limit.
    pub fn with_send_rate(mut self, rate: u64) -> Self {
        self.send_rate = rate;
        self
    }

    /// Set the inbound rate limit.
    pub fn with_recv_rate(mut self, rate: u64) -> Self {
        self.recv_rate = rate;
        self
    }

    /// Set the maximum per-packet payload size.
    pub fn with_max_packet_msg_payload_size(mut self, size: usize) -> Self {
        self.max_packet_msg_payload_size = size;
        self
    }

    /// Set the flush throttle.
    pub fn with_flush_throttle(mut self, throttle: Duration) -> Self {
        self.flush_throttle = throttle;
        self
    }

    /// Set the ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// The largest wire frame this configuration will accept, derived from
    /// the payload bound plus the packet header overhead.
    pub fn max_packet_size(&self) -> usize {
        crate::protocol::max_packet_size(self.max_packet_msg_payload_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnConfig::default();
        assert_eq!(config.send_rate, DEFAULT_SEND_RATE);
        assert_eq!(config.recv_rate, DEFAULT_RECV_RATE);
        assert_eq!(config.max_packet_msg_payload_size, 1024);
        assert!(config.pong_timeout < config.ping_interval);
    }

    #[test]
    fn test_builders() {
        let config = ConnConfig::new()
            .with_send_rate(1_000)
            .with_recv_rate(2_000)
            .with_max_packet_msg_payload_size(256)
            .with_flush_throttle(Duration::from_millis(10))
            .with_ping_interval(Duration::from_millis(90))
            .with_pong_timeout(Duration::from_millis(45));

        assert_eq!(config.send_rate, 1_000);
        assert_eq!(config.recv_rate, 2_000);
        assert_eq!(config.max_packet_msg_payload_size, 256);
        assert_eq!(config.flush_throttle, Duration::from_millis(10));
        assert_eq!(config.ping_interval, Duration::from_millis(90));
        assert_eq!(config.pong_timeout, Duration::from_millis(45));
    }

    #[test]
    fn test_max_packet_size_covers_payload() {
        let config = ConnConfig::default();
        assert!(config.max_packet_size() > config.max_packet_msg_payload_size);
    }
}
