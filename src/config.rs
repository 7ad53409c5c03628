//! Engine configuration
//!
//! `ClientConfig` is the option bag consumed by
//! [`Engine::start_with_config`](crate::engine::Engine::start_with_config).
//! Options map one-to-one onto the knobs of the connection lifecycle:
//! keepalive cadence and tolerance, the bounded connect timeout, TLS
//! verification, handshake headers and codec limits.

use crate::frame::FrameCodec;
use crate::transport::TlsVerify;
use std::time::Duration;

/// Configuration for a sockwave engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval between automatic keepalive pings. `None` disables keepalive.
    pub keepalive: Option<Duration>,
    /// Number of unanswered keepalive ticks tolerated before the connection
    /// is declared dead.
    pub keepalive_max_attempts: u32,
    /// Upper bound on transport connect + TLS handshake.
    pub connect_timeout: Duration,
    /// TLS peer verification mode, used only for `wss://` targets.
    pub tls_verify: TlsVerify,
    /// Set TCP_NODELAY on the socket.
    pub nodelay: bool,
    /// Extra headers for the upgrade request (last-wins on duplicate names).
    pub extra_headers: Vec<(String, String)>,
    /// Value to send as `Sec-WebSocket-Protocol`, echoed back by the server.
    pub subprotocol: Option<String>,
    /// Maximum accepted frame payload size.
    pub max_frame_size: usize,
    /// Maximum accepted reassembled message size.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive: None,
            keepalive_max_attempts: 3,
            connect_timeout: Duration::from_secs(6),
            tls_verify: TlsVerify::Peer,
            nodelay: true,
            extra_headers: Vec::new(),
            subprotocol: None,
            max_frame_size: FrameCodec::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: FrameCodec::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable keepalive pings at the given interval.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    pub fn keepalive_max_attempts(mut self, attempts: u32) -> Self {
        self.keepalive_max_attempts = attempts;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tls_verify(mut self, verify: TlsVerify) -> Self {
        self.tls_verify = verify;
        self
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Append an extra header to the upgrade request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocol = Some(protocol.into());
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}
