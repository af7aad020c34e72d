//! Client configuration for Parley Core

use std::time::Duration;

/// Connection and timing configuration.
///
/// The durations default to production values; tests shrink them to
/// milliseconds instead of mocking the clock.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    /// STUN servers handed to the peer connection.
    pub stun_urls: Vec<String>,
    /// Bound on the auth handshake outcome.
    pub connect_timeout: Duration,
    /// How long an outbound call rings before giving up.
    pub ring_timeout: Duration,
    /// Quiet period after the last keystroke before typing_stop is emitted.
    pub typing_stop_delay: Duration,
    /// How long a peer's typing flag survives without a refresh.
    pub typing_expiry: Duration,
    /// Grace window for an offer arriving before negotiation has started.
    pub offer_wait: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 8443,
            use_tls: true,
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            connect_timeout: Duration::from_secs(5),
            ring_timeout: Duration::from_secs(30),
            typing_stop_delay: Duration::from_secs(1),
            typing_expiry: Duration::from_secs(2),
            offer_wait: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            ..Self::default()
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }
}
