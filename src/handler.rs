//! Handler contract
//!
//! A [`Handler`] is the user-supplied behaviour driving an engine: it decides
//! whether to connect at startup, reacts to every received frame, and picks
//! the reconnect policy after each disconnect. The handler's `State` is moved
//! through every callback and handed back inside the returned directive; the
//! engine keeps exactly one copy and never aliases it.

use crate::frame::CloseReason;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// A logical WebSocket message, as seen by a handler.
///
/// Close frames are not delivered here; they drive the disconnect path and
/// surface through [`Handler::on_disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl Message {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Get the message as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the message payload bytes, whatever the kind.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// True for Ping and Pong.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_))
    }
}

/// Properties of the current connection, visible to handler callbacks and to
/// engine handles while Connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnContext {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// True when the connection runs over TLS (`wss://`).
    pub secure: bool,
    /// Subprotocol echoed by the server, if one was requested.
    pub subprotocol: Option<String>,
    /// Effective keepalive interval for this connection.
    pub keepalive: Option<Duration>,
}

/// Why a connection ended, as reported to [`Handler::on_disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Opening the transport failed.
    ConnectFailed(String),
    /// The upgrade was not completed (non-101, bad accept key, EOF mid-handshake).
    HandshakeFailed(String),
    /// The peer sent a close frame.
    RemoteClosed {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// A handler directive closed the connection.
    LocalClosed,
    /// The transport reached EOF without a close frame.
    TransportClosed,
    /// Writing to the transport failed.
    TransportError(String),
    /// The peer stopped answering keepalive pings.
    KeepaliveTimeout,
    /// The peer violated RFC 6455 framing rules.
    ProtocolViolation { code: u16, reason: String },
}

/// Why the engine is going away, as reported to [`Handler::on_terminate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// The transport reached EOF while Connected.
    RemoteClosed,
    /// A transport read error while Connected; the engine stops.
    SocketError(String),
    /// A handler callback panicked; the engine stops.
    HandlerFailure(String),
    /// The engine was shut down or a disconnect directive terminated it.
    Shutdown,
}

/// Directive returned by [`Handler::init`].
#[derive(Debug)]
pub enum Init<S> {
    /// Start disconnected and wait for an explicit connect.
    Idle(S),
    /// Attempt one connect immediately; later behavior follows
    /// [`Handler::on_disconnect`] directives.
    ConnectOnce(S),
    /// Attempt to connect immediately and keep reconnecting: whenever
    /// `on_disconnect` answers `Idle`, the engine retries on its own after a
    /// short fixed delay.
    ConnectAndRetry(S),
}

/// Directive returned by [`Handler::on_connect`].
#[derive(Debug)]
pub enum OnConnect<S> {
    Continue(S),
    /// Continue and (re)arm the keepalive timer at this interval, overriding
    /// the configured value for this connection.
    KeepaliveEvery(Duration, S),
    /// Send a message before processing anything else.
    Reply(Message, S),
    /// Close the connection with an optional code and reason.
    Close(Option<CloseReason>, S),
}

/// Directive returned by [`Handler::on_frame`] and [`Handler::on_external`].
#[derive(Debug)]
pub enum OnFrame<S> {
    Continue(S),
    /// Send a message; it is written before the next inbound frame is
    /// processed.
    Reply(Message, S),
    Close(Option<CloseReason>, S),
}

/// Directive returned by [`Handler::on_disconnect`].
#[derive(Debug)]
pub enum OnDisconnect<S> {
    /// Stay disconnected.
    Idle(S),
    /// Reconnect immediately.
    Reconnect(S),
    /// Reconnect after the given delay. An explicit `connect()` in the
    /// meantime cancels the timer and connects at once.
    ReconnectAfter(Duration, S),
    /// Stop the engine.
    Terminate(S),
}

/// The callback surface a sockwave user implements.
///
/// All callbacks run on the engine's driver task, strictly serialized with
/// socket and timer events. Blocking here stalls the connection.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Opaque user state threaded through every callback.
    type State: Send + Sync + Debug + 'static;
    /// Messages injected from outside the connection via
    /// [`Engine::notify`](crate::engine::Engine::notify).
    type External: Send + Debug + 'static;

    /// Called once when the engine starts; decides the initial connect
    /// behavior and produces the initial state.
    async fn init(&mut self) -> Init<Self::State>;

    /// Called after the 101 response has been validated.
    async fn on_connect(&mut self, ctx: &ConnContext, state: Self::State)
        -> OnConnect<Self::State>;

    /// Called on every transition into Disconnected; the directive picks the
    /// reconnect policy.
    async fn on_disconnect(
        &mut self,
        reason: &DisconnectReason,
        state: Self::State,
    ) -> OnDisconnect<Self::State>;

    /// Called for every decoded frame, pings and pongs included. The engine
    /// has already answered a ping with a pong by the time this runs.
    async fn on_frame(
        &mut self,
        message: &Message,
        ctx: &ConnContext,
        state: Self::State,
    ) -> OnFrame<Self::State>;

    /// Called for messages injected with `notify` while Connected.
    async fn on_external(
        &mut self,
        _message: Self::External,
        _ctx: &ConnContext,
        state: Self::State,
    ) -> OnFrame<Self::State> {
        OnFrame::Continue(state)
    }

    /// Called when the engine stops for good. Side effects only. The state
    /// is `None` when the callback that failed had already consumed it
    /// ([`TerminateReason::HandlerFailure`]).
    async fn on_terminate(
        &mut self,
        _reason: &TerminateReason,
        _ctx: Option<&ConnContext>,
        _state: Option<&Self::State>,
    ) {
    }
}
