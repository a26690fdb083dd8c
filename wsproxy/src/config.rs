use std::time::Duration;

pub const DEFAULT_TUNNEL_PATH: &str = "/__ws_proxy";

/// Time allowed to write a frame to the agent.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed to read the next frame (or pong) from the agent.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Must be less than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const OUTBOUND_CAPACITY: usize = 256;
/// Unread response body bytes held for one exchange before it is failed.
pub const BODY_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Path that upgrades to the tunnel transport.
    pub tunnel_path: String,
    /// Shared secret expected in the `password` query parameter, if any.
    pub password: Option<String>,
    /// Overall deadline of one exchange, armed when it is registered.
    pub request_timeout: Duration,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub outbound_capacity: usize,
    pub body_buffer_limit: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tunnel_path: DEFAULT_TUNNEL_PATH.to_string(),
            password: None,
            request_timeout: REQUEST_TIMEOUT,
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            outbound_capacity: OUTBOUND_CAPACITY,
            body_buffer_limit: BODY_BUFFER_LIMIT,
        }
    }
}

impl TunnelConfig {
    /// Sets the read-liveness deadline and derives the ping period from it.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_period_tracks_pong_wait() {
        let config = TunnelConfig::default().with_pong_wait(Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(9));
        assert_eq!(TunnelConfig::default().ping_period, PONG_WAIT * 9 / 10);
    }

    #[test]
    fn test_empty_password_disables_check() {
        let config = TunnelConfig::default().with_password(Some(String::new()));
        assert!(config.password.is_none());
    }
}
