use thiserror::Error;

/// Main error type for sockwave
#[derive(Error, Debug)]
pub enum SockwaveError {
    /// The URL could not be parsed or uses an unsupported scheme
    #[error("invalid URL: {0}")]
    UrlInvalid(String),

    /// Opening the transport connection failed
    #[error("connect failed: {0}")]
    TransportConnect(String),

    /// I/O error on an established connection
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server did not complete the HTTP upgrade
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The peer violated RFC 6455 framing rules
    #[error("protocol violation ({code}): {reason}")]
    ProtocolViolation { code: u16, reason: String },

    /// The peer stopped answering keepalive pings
    #[error("keepalive timeout")]
    KeepaliveTimeout,

    /// The peer closed the connection with a close frame
    #[error("remote closed: code {code:?}, reason {reason:?}")]
    RemoteClosed {
        code: Option<u16>,
        reason: Option<String>,
    },

    /// A handler callback panicked
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Operation requires a connected engine
    #[error("not connected")]
    Disconnected,

    /// Channel send error
    #[error("channel send error: {0}")]
    ChannelSend(String),
}

/// Result type for sockwave operations
pub type Result<T> = std::result::Result<T, SockwaveError>;
