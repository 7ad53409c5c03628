//! Connection engine
//!
//! The engine owns the full connection lifecycle: it dials the transport,
//! drives the upgrade handshake, decodes frames, invokes handler callbacks,
//! answers pings, accounts keepalive misses and applies the handler's
//! reconnect directives.
//!
//! All of that happens on a single spawned driver task. The [`Engine`] handle
//! only pushes commands into the driver's mailbox and reads lock-free state,
//! so connection state itself is never shared or locked.
//!
//! ```text
//!            ┌─────────────────────────────────────────────┐
//!  send ─────┤                driver task                  │
//!  cast ─────┤  select! { socket bytes | commands | tick } │──▶ handler
//!  notify ───┤  Disconnected ⇆ Handshaking ⇆ Connected     │◀── directives
//!  connect ──┤                                             │
//!            └─────────────────────────────────────────────┘
//! ```

use crate::config::ClientConfig;
use crate::error::{Result, SockwaveError};
use crate::frame::{CloseReason, Frame, FrameCodec, Opcode};
use crate::handler::{
    ConnContext, DisconnectReason, Handler, Init, Message, OnConnect, OnDisconnect, OnFrame,
    TerminateReason,
};
use crate::handshake::{ClientHandshake, WsUrl};
use crate::state::{AtomicLifecycle, AtomicMetrics, Lifecycle, Metrics};
use crate::transport::{TcpTransport, Transport};
use bytes::BytesMut;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Delay between automatic retries under [`Init::ConnectAndRetry`] when the
/// handler's `on_disconnect` does not pick an explicit policy.
const AUTO_RETRY_DELAY: Duration = Duration::from_secs(1);

const MISSING_STATE: &str = "handler state lost";

/// Commands from engine handles to the driver task.
enum Command<X> {
    Connect {
        reply: crossbeam_channel::Sender<Result<()>>,
    },
    Send {
        message: Message,
        reply: crossbeam_channel::Sender<Result<()>>,
    },
    Cast(Message),
    External(X),
    Shutdown,
}

/// Observer events emitted by the driver.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Handshake validated, frames can flow.
    Connected,
    /// A previously connected session ended.
    Disconnected,
    /// A reconnect attempt is starting (1-based attempt number).
    Reconnecting(u64),
    /// Something went wrong; the engine may or may not stop.
    Error(String),
    /// The driver task has exited.
    Terminated,
}

/// Handle to a running engine.
///
/// Dropping the handle (without [`shutdown`](Engine::shutdown)) closes the
/// command channel and stops the driver on its next loop turn.
pub struct Engine<H: Handler> {
    commands: mpsc::UnboundedSender<Command<H::External>>,
    lifecycle: Arc<AtomicLifecycle>,
    metrics: Arc<AtomicMetrics>,
    session: Arc<RwLock<Option<ConnContext>>>,
    events: crossbeam_channel::Receiver<EngineEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl<H: Handler> Engine<H> {
    /// Start an engine with default configuration.
    ///
    /// Must be called from within a Tokio runtime; the driver is spawned onto
    /// it. The URL is validated here, before anything is spawned.
    pub fn start(url: &str, handler: H) -> Result<Self> {
        Self::start_with_config(url, handler, ClientConfig::default())
    }

    /// Start an engine with explicit configuration.
    pub fn start_with_config(url: &str, handler: H, config: ClientConfig) -> Result<Self> {
        let url = WsUrl::parse(url)?;
        let transport = TcpTransport::from_config(&config, url.secure)?;
        Self::start_with_transport(url, handler, config, transport)
    }

    /// Start an engine on a custom [`Transport`] implementation.
    pub fn start_with_transport<T: Transport>(
        url: WsUrl,
        handler: H,
        config: ClientConfig,
        transport: T,
    ) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let lifecycle = Arc::new(AtomicLifecycle::new(Lifecycle::Disconnected));
        let metrics = Arc::new(AtomicMetrics::new());
        let session = Arc::new(RwLock::new(None));

        let driver = Driver {
            handler,
            url,
            config,
            transport,
            commands: command_rx,
            lifecycle: Arc::clone(&lifecycle),
            metrics: Arc::clone(&metrics),
            session: Arc::clone(&session),
            events: event_tx,
            auto_retry: false,
            reconnect_attempt: 0,
            pending_connects: Vec::new(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            commands: command_tx,
            lifecycle,
            metrics,
            session,
            events: event_rx,
            task,
        })
    }

    /// Send a message and wait for the write outcome.
    ///
    /// Fails with [`SockwaveError::Disconnected`] unless the engine is
    /// Connected; a transport write failure is returned as-is. This blocks
    /// the calling thread on the driver's reply, so do not call it from a
    /// current-thread runtime.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.lifecycle.is_connected() {
            return Err(SockwaveError::Disconnected);
        }
        let (reply, outcome) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Send { message, reply })
            .map_err(|e| SockwaveError::ChannelSend(e.to_string()))?;
        outcome
            .recv()
            .unwrap_or_else(|_| Err(SockwaveError::Disconnected))
    }

    /// Fire-and-forget send. Silently dropped when not Connected.
    pub fn cast(&self, message: Message) {
        if !self.lifecycle.is_connected() {
            debug!("cast dropped: engine not connected");
            return;
        }
        let _ = self.commands.send(Command::Cast(message));
    }

    /// Inject an external message; it reaches [`Handler::on_external`] only
    /// while Connected.
    pub fn notify(&self, message: H::External) {
        let _ = self.commands.send(Command::External(message));
    }

    /// Ask the engine to connect now and wait for the attempt's outcome.
    /// Cancels a pending reconnect timer, if one is armed.
    pub fn connect(&self) -> Result<()> {
        let (reply, outcome) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Connect { reply })
            .map_err(|e| SockwaveError::ChannelSend(e.to_string()))?;
        outcome
            .recv()
            .unwrap_or_else(|_| Err(SockwaveError::Disconnected))
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Counters snapshot.
    pub fn metrics(&self) -> Metrics {
        Metrics {
            frames_sent: self.metrics.frames_sent(),
            frames_received: self.metrics.frames_received(),
            reconnects: self.metrics.reconnects(),
            pings_sent: self.metrics.pings_sent(),
            lifecycle: self.lifecycle.get(),
        }
    }

    /// Properties of the current connection, while one exists.
    pub fn context(&self) -> Option<ConnContext> {
        self.session.read().clone()
    }

    /// Non-blocking observer event read.
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.events.try_recv().ok()
    }

    /// Blocking observer event read.
    pub fn recv_event(&self) -> std::result::Result<EngineEvent, crossbeam_channel::RecvError> {
        self.events.recv()
    }

    /// Stop the engine and wait for the driver task to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.task.await;
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// What the outer loop does next while Disconnected.
enum NextStep {
    ConnectNow,
    Idle,
    WaitUntil(Instant),
    Stop,
}

/// How a session (one transport connection) ended.
enum SessionEnd {
    /// Shutdown command or all handles dropped; `on_terminate` already ran.
    Stopped,
    /// A handler callback panicked; the engine stops.
    HandlerFailed(String),
    /// Transport read error while Connected; `on_terminate` already ran and
    /// the engine stops.
    Fatal(String),
    /// Ordinary end; the disconnect subprotocol decides what happens next.
    Disconnected {
        reason: DisconnectReason,
        was_connected: bool,
    },
}

/// Per-connection phase inside a session.
enum Phase {
    Handshaking(ClientHandshake),
    Connected(ConnContext),
}

struct Driver<H: Handler, T: Transport> {
    handler: H,
    url: WsUrl,
    config: ClientConfig,
    transport: T,
    commands: mpsc::UnboundedReceiver<Command<H::External>>,
    lifecycle: Arc<AtomicLifecycle>,
    metrics: Arc<AtomicMetrics>,
    session: Arc<RwLock<Option<ConnContext>>>,
    events: crossbeam_channel::Sender<EngineEvent>,
    /// Standing reconnect policy declared by `Init::ConnectAndRetry`.
    auto_retry: bool,
    reconnect_attempt: u64,
    /// Callers of `connect()` waiting for the attempt's outcome.
    pending_connects: Vec<crossbeam_channel::Sender<Result<()>>>,
}

impl<H: Handler, T: Transport> Driver<H, T> {
    async fn run(mut self) {
        let mut state: Option<H::State> = None;

        let mut next = match guard::<H, _, _, _>(
            "init",
            || "engine start".to_string(),
            self.handler.init(),
        )
        .await
        {
            Err(panic) => {
                self.notify_terminate(
                    &TerminateReason::HandlerFailure(panic.clone()),
                    None,
                    &mut state,
                )
                .await;
                let _ = self.events.send(EngineEvent::Error(panic));
                NextStep::Stop
            }
            Ok(Init::Idle(s)) => {
                state = Some(s);
                NextStep::Idle
            }
            Ok(Init::ConnectOnce(s)) => {
                state = Some(s);
                NextStep::ConnectNow
            }
            Ok(Init::ConnectAndRetry(s)) => {
                state = Some(s);
                self.auto_retry = true;
                NextStep::ConnectNow
            }
        };

        loop {
            next = match next {
                NextStep::Stop => break,
                NextStep::ConnectNow => self.connect_cycle(&mut state).await,
                NextStep::Idle => self.idle(None, &mut state).await,
                NextStep::WaitUntil(at) => self.idle(Some(at), &mut state).await,
            };
        }

        self.lifecycle.set(Lifecycle::Terminated);
        let _ = self.events.send(EngineEvent::Terminated);
        debug!("engine driver exiting");
    }

    /// Disconnected: wait for a command or the reconnect deadline.
    async fn idle(&mut self, deadline: Option<Instant>, state: &mut Option<H::State>) -> NextStep {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect { reply }) => {
                        if deadline.is_some() {
                            debug!("explicit connect cancels the pending reconnect timer");
                        }
                        self.pending_connects.push(reply);
                        return NextStep::ConnectNow;
                    }
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(SockwaveError::Disconnected));
                    }
                    Some(Command::Cast(_)) => debug!("cast dropped while disconnected"),
                    Some(Command::External(_)) => {
                        debug!("external message ignored while disconnected");
                    }
                    Some(Command::Shutdown) | None => {
                        self.notify_terminate(&TerminateReason::Shutdown, None, state).await;
                        return NextStep::Stop;
                    }
                },
                () = maybe_sleep(deadline) => {
                    debug!("reconnect timer fired");
                    return NextStep::ConnectNow;
                }
            }
        }
    }

    /// One connect attempt plus the session it produces, then the disconnect
    /// subprotocol.
    async fn connect_cycle(&mut self, state: &mut Option<H::State>) -> NextStep {
        self.lifecycle.set(Lifecycle::Handshaking);
        if self.reconnect_attempt > 0 {
            let _ = self
                .events
                .send(EngineEvent::Reconnecting(self.reconnect_attempt));
            self.metrics.increment_reconnects();
        }
        self.reconnect_attempt += 1;

        let end = self.run_session(state).await;

        // Disconnect subprotocol: the socket, codec and partial-read buffer
        // died with the session's locals; clear the published context.
        self.lifecycle.set(Lifecycle::Disconnected);
        self.session.write().take();

        match end {
            SessionEnd::Stopped => NextStep::Stop,
            SessionEnd::HandlerFailed(reason) => {
                // The failing callback consumed the state, so on_terminate
                // gets None.
                self.notify_terminate(&TerminateReason::HandlerFailure(reason.clone()), None, state)
                    .await;
                self.fail_pending_connects(&SockwaveError::HandlerFailure(reason.clone()));
                let _ = self.events.send(EngineEvent::Error(reason));
                NextStep::Stop
            }
            SessionEnd::Fatal(reason) => {
                self.fail_pending_connects(&SockwaveError::Disconnected);
                let _ = self.events.send(EngineEvent::Error(reason));
                NextStep::Stop
            }
            SessionEnd::Disconnected {
                reason,
                was_connected,
            } => {
                if was_connected {
                    let _ = self.events.send(EngineEvent::Disconnected);
                } else {
                    let _ = self.events.send(EngineEvent::Error(format!("{reason:?}")));
                }
                self.fail_pending_connects(&reason_to_error(&reason));

                let Some(s) = state.take() else {
                    return NextStep::Stop;
                };
                match guard::<H, _, _, _>(
                    "on_disconnect",
                    || format!("{reason:?}"),
                    self.handler.on_disconnect(&reason, s),
                )
                .await
                {
                    Err(panic) => {
                        self.notify_terminate(
                            &TerminateReason::HandlerFailure(panic.clone()),
                            None,
                            state,
                        )
                        .await;
                        let _ = self.events.send(EngineEvent::Error(panic));
                        NextStep::Stop
                    }
                    Ok(OnDisconnect::Idle(s)) => {
                        *state = Some(s);
                        if self.auto_retry {
                            debug!("standing reconnect policy schedules a retry");
                            NextStep::WaitUntil(Instant::now() + AUTO_RETRY_DELAY)
                        } else {
                            NextStep::Idle
                        }
                    }
                    Ok(OnDisconnect::Reconnect(s)) => {
                        *state = Some(s);
                        NextStep::ConnectNow
                    }
                    Ok(OnDisconnect::ReconnectAfter(delay, s)) => {
                        *state = Some(s);
                        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                        NextStep::WaitUntil(Instant::now() + delay)
                    }
                    Ok(OnDisconnect::Terminate(s)) => {
                        *state = Some(s);
                        self.notify_terminate(&TerminateReason::Shutdown, None, state).await;
                        NextStep::Stop
                    }
                }
            }
        }
    }

    /// Dial, handshake, then pump frames until the session ends.
    async fn run_session(&mut self, state: &mut Option<H::State>) -> SessionEnd {
        info!(host = %self.url.host, port = self.url.port, secure = self.url.secure, "connecting");

        let mut stream = match self.transport.connect(&self.url.host, self.url.port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "connect failed");
                return SessionEnd::Disconnected {
                    reason: DisconnectReason::ConnectFailed(e.to_string()),
                    was_connected: false,
                };
            }
        };

        // Fresh key per attempt.
        let handshake = ClientHandshake::new(
            &self.url,
            self.config.subprotocol.as_deref(),
            &self.config.extra_headers,
        );
        if let Err(e) = stream.write_all(&handshake.request_bytes()).await {
            return SessionEnd::Disconnected {
                reason: DisconnectReason::HandshakeFailed(e.to_string()),
                was_connected: false,
            };
        }

        let mut codec = FrameCodec::client()
            .max_frame_size(self.config.max_frame_size)
            .max_message_size(self.config.max_message_size);
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut out = BytesMut::with_capacity(8 * 1024);
        let mut phase = Phase::Handshaking(handshake);
        let mut keepalive =
            KeepaliveTimer::new(self.config.keepalive, self.config.keepalive_max_attempts);

        loop {
            buf.reserve(4 * 1024);
            tokio::select! {
                read = stream.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        return match &phase {
                            Phase::Handshaking(_) => SessionEnd::Disconnected {
                                reason: DisconnectReason::HandshakeFailed(
                                    "connection closed before the upgrade completed".into(),
                                ),
                                was_connected: false,
                            },
                            Phase::Connected(ctx) => {
                                warn!("transport closed by peer");
                                let ctx = ctx.clone();
                                self.notify_terminate(&TerminateReason::RemoteClosed, Some(&ctx), state)
                                    .await;
                                SessionEnd::Disconnected {
                                    reason: DisconnectReason::TransportClosed,
                                    was_connected: true,
                                }
                            }
                        };
                    }
                    Ok(_) => {
                        // Handshake completion first; leftover bytes past the
                        // 101 terminator flow straight into the frame codec.
                        let negotiated = if let Phase::Handshaking(hs) = &phase {
                            match hs.read_response(&mut buf) {
                                Ok(None) => continue,
                                Ok(Some(negotiated)) => Some(negotiated),
                                Err(e) => {
                                    warn!(error = %e, "handshake rejected");
                                    return SessionEnd::Disconnected {
                                        reason: DisconnectReason::HandshakeFailed(e.to_string()),
                                        was_connected: false,
                                    };
                                }
                            }
                        } else {
                            None
                        };

                        if let Some(negotiated) = negotiated {
                            match self
                                .finish_handshake(
                                    negotiated.subprotocol,
                                    &mut stream,
                                    &mut codec,
                                    &mut out,
                                    &mut keepalive,
                                    state,
                                )
                                .await
                            {
                                Ok(ctx) => phase = Phase::Connected(ctx),
                                Err(end) => return end,
                            }
                        }

                        if let Phase::Connected(ctx) = &phase {
                            if let Some(end) = self
                                .drain_frames(
                                    &mut stream,
                                    &mut codec,
                                    &mut buf,
                                    &mut out,
                                    ctx,
                                    &mut keepalive,
                                    state,
                                )
                                .await
                            {
                                return end;
                            }
                        }
                    }
                    Err(e) => {
                        return match &phase {
                            Phase::Handshaking(_) => SessionEnd::Disconnected {
                                reason: DisconnectReason::HandshakeFailed(e.to_string()),
                                was_connected: false,
                            },
                            Phase::Connected(ctx) => {
                                error!(error = %e, "transport read error");
                                let ctx = ctx.clone();
                                self.notify_terminate(
                                    &TerminateReason::SocketError(e.to_string()),
                                    Some(&ctx),
                                    state,
                                )
                                .await;
                                SessionEnd::Fatal(e.to_string())
                            }
                        };
                    }
                },

                cmd = self.commands.recv() => {
                    if let Some(end) = self
                        .handle_command(cmd, &mut stream, &mut codec, &mut out, &phase, state)
                        .await
                    {
                        return end;
                    }
                }

                () = keepalive.tick() => {
                    if keepalive.register_miss() {
                        warn!(
                            max_attempts = self.config.keepalive_max_attempts,
                            "keepalive timeout"
                        );
                        return SessionEnd::Disconnected {
                            reason: DisconnectReason::KeepaliveTimeout,
                            was_connected: matches!(phase, Phase::Connected(_)),
                        };
                    }
                    if matches!(phase, Phase::Connected(_)) {
                        debug!(attempt = keepalive.attempts, "keepalive ping");
                        if let Err(e) =
                            write_frame(&mut stream, &mut codec, &mut out, &Frame::ping(""), &self.metrics).await
                        {
                            return SessionEnd::Disconnected {
                                reason: DisconnectReason::TransportError(e.to_string()),
                                was_connected: true,
                            };
                        }
                        self.metrics.increment_pings();
                    }
                }
            }
        }
    }

    /// The 101 response validated: transition to Connected and run the
    /// handler's `on_connect`.
    async fn finish_handshake(
        &mut self,
        subprotocol: Option<String>,
        stream: &mut T::Stream,
        codec: &mut FrameCodec,
        out: &mut BytesMut,
        keepalive: &mut KeepaliveTimer,
        state: &mut Option<H::State>,
    ) -> std::result::Result<ConnContext, SessionEnd> {
        let mut ctx = ConnContext {
            host: self.url.host.clone(),
            port: self.url.port,
            path: self.url.path.clone(),
            secure: self.url.secure,
            subprotocol,
            keepalive: keepalive.period(),
        };

        info!(host = %ctx.host, subprotocol = ?ctx.subprotocol, "connected");
        self.lifecycle.set(Lifecycle::Connected);
        self.reconnect_attempt = 0;
        keepalive.reset_attempts();

        let Some(s) = state.take() else {
            return Err(SessionEnd::HandlerFailed(MISSING_STATE.into()));
        };
        let directive = match guard::<H, _, _, _>(
            "on_connect",
            || format!("{ctx:?}"),
            self.handler.on_connect(&ctx, s),
        )
        .await
        {
            Ok(directive) => directive,
            Err(panic) => return Err(SessionEnd::HandlerFailed(panic)),
        };

        let mut reply = None;
        let mut close = None;
        match directive {
            OnConnect::Continue(s) => *state = Some(s),
            OnConnect::KeepaliveEvery(period, s) => {
                *state = Some(s);
                keepalive.rearm(Some(period));
                ctx.keepalive = Some(period);
            }
            OnConnect::Reply(message, s) => {
                *state = Some(s);
                reply = Some(message);
            }
            OnConnect::Close(reason, s) => {
                *state = Some(s);
                close = Some(reason.unwrap_or_else(CloseReason::normal));
            }
        }

        *self.session.write() = Some(ctx.clone());
        let _ = self.events.send(EngineEvent::Connected);
        for waiter in self.pending_connects.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if let Some(reason) = close {
            let _ =
                write_frame(stream, codec, out, &Frame::close(Some(&reason)), &self.metrics).await;
            return Err(SessionEnd::Disconnected {
                reason: DisconnectReason::LocalClosed,
                was_connected: true,
            });
        }
        if let Some(message) = reply {
            if let Err(e) =
                write_frame(stream, codec, out, &message_to_frame(message), &self.metrics).await
            {
                return Err(SessionEnd::Disconnected {
                    reason: DisconnectReason::TransportError(e.to_string()),
                    was_connected: true,
                });
            }
        }

        Ok(ctx)
    }

    /// Decode every complete frame in the buffer, in receive order.
    #[allow(clippy::too_many_arguments)]
    async fn drain_frames(
        &mut self,
        stream: &mut T::Stream,
        codec: &mut FrameCodec,
        buf: &mut BytesMut,
        out: &mut BytesMut,
        ctx: &ConnContext,
        keepalive: &mut KeepaliveTimer,
        state: &mut Option<H::State>,
    ) -> Option<SessionEnd> {
        loop {
            match codec.decode(buf) {
                Ok(None) => return None,
                Ok(Some(frame)) => {
                    // Any inbound frame proves the peer alive.
                    keepalive.reset_attempts();
                    self.metrics.increment_received();

                    if frame.opcode == Opcode::Close {
                        let reason = CloseReason::parse(&frame.payload);
                        info!(code = ?reason.code, "close frame from peer");
                        // Echo the peer's code before going down.
                        let echo = CloseReason {
                            code: Some(reason.code.unwrap_or(1000)),
                            text: None,
                        };
                        let _ = write_frame(
                            stream,
                            codec,
                            out,
                            &Frame::close(Some(&echo)),
                            &self.metrics,
                        )
                        .await;
                        return Some(SessionEnd::Disconnected {
                            reason: DisconnectReason::RemoteClosed {
                                code: reason.code,
                                reason: reason.text,
                            },
                            was_connected: true,
                        });
                    }

                    if frame.opcode == Opcode::Ping {
                        // Auto-pong with the identical payload, before the
                        // handler sees the ping.
                        if let Err(e) = write_frame(
                            stream,
                            codec,
                            out,
                            &Frame::pong(frame.payload.clone()),
                            &self.metrics,
                        )
                        .await
                        {
                            return Some(SessionEnd::Disconnected {
                                reason: DisconnectReason::TransportError(e.to_string()),
                                was_connected: true,
                            });
                        }
                    }

                    let Some(message) = frame_to_message(&frame) else {
                        continue;
                    };
                    let Some(s) = state.take() else {
                        return Some(SessionEnd::HandlerFailed(MISSING_STATE.into()));
                    };
                    let directive = match guard::<H, _, _, _>(
                        "on_frame",
                        || format!("{message:?}"),
                        self.handler.on_frame(&message, ctx, s),
                    )
                    .await
                    {
                        Ok(directive) => directive,
                        Err(panic) => return Some(SessionEnd::HandlerFailed(panic)),
                    };
                    if let Some(end) = self
                        .apply_frame_directive(directive, stream, codec, out, state)
                        .await
                    {
                        return Some(end);
                    }
                }
                Err(violation) => {
                    warn!(code = violation.code, reason = violation.reason, "protocol violation");
                    let close = CloseReason::new(violation.code, Some(violation.reason));
                    let _ =
                        write_frame(stream, codec, out, &Frame::close(Some(&close)), &self.metrics)
                            .await;
                    return Some(SessionEnd::Disconnected {
                        reason: DisconnectReason::ProtocolViolation {
                            code: violation.code,
                            reason: violation.reason.to_string(),
                        },
                        was_connected: true,
                    });
                }
            }
        }
    }

    /// Apply an [`OnFrame`] directive; a reply is written before the next
    /// inbound frame is decoded.
    async fn apply_frame_directive(
        &mut self,
        directive: OnFrame<H::State>,
        stream: &mut T::Stream,
        codec: &mut FrameCodec,
        out: &mut BytesMut,
        state: &mut Option<H::State>,
    ) -> Option<SessionEnd> {
        match directive {
            OnFrame::Continue(s) => {
                *state = Some(s);
                None
            }
            OnFrame::Reply(message, s) => {
                *state = Some(s);
                match write_frame(stream, codec, out, &message_to_frame(message), &self.metrics)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(SessionEnd::Disconnected {
                        reason: DisconnectReason::TransportError(e.to_string()),
                        was_connected: true,
                    }),
                }
            }
            OnFrame::Close(reason, s) => {
                *state = Some(s);
                let reason = reason.unwrap_or_else(CloseReason::normal);
                let _ =
                    write_frame(stream, codec, out, &Frame::close(Some(&reason)), &self.metrics)
                        .await;
                Some(SessionEnd::Disconnected {
                    reason: DisconnectReason::LocalClosed,
                    was_connected: true,
                })
            }
        }
    }

    /// Handle a command that arrived while a session is active.
    async fn handle_command(
        &mut self,
        cmd: Option<Command<H::External>>,
        stream: &mut T::Stream,
        codec: &mut FrameCodec,
        out: &mut BytesMut,
        phase: &Phase,
        state: &mut Option<H::State>,
    ) -> Option<SessionEnd> {
        match cmd {
            Some(Command::Connect { reply }) => {
                match phase {
                    // Already up; the attempt trivially succeeded.
                    Phase::Connected(_) => {
                        let _ = reply.send(Ok(()));
                    }
                    // Attempt in flight; answer when it resolves.
                    Phase::Handshaking(_) => self.pending_connects.push(reply),
                }
                None
            }
            Some(Command::Send { message, reply }) => {
                if matches!(phase, Phase::Connected(_)) {
                    match write_frame(stream, codec, out, &message_to_frame(message), &self.metrics)
                        .await
                    {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                            None
                        }
                        Err(e) => {
                            let description = e.to_string();
                            let _ = reply.send(Err(e));
                            Some(SessionEnd::Disconnected {
                                reason: DisconnectReason::TransportError(description),
                                was_connected: true,
                            })
                        }
                    }
                } else {
                    let _ = reply.send(Err(SockwaveError::Disconnected));
                    None
                }
            }
            Some(Command::Cast(message)) => {
                if matches!(phase, Phase::Connected(_)) {
                    if let Err(e) =
                        write_frame(stream, codec, out, &message_to_frame(message), &self.metrics)
                            .await
                    {
                        return Some(SessionEnd::Disconnected {
                            reason: DisconnectReason::TransportError(e.to_string()),
                            was_connected: true,
                        });
                    }
                } else {
                    debug!("cast dropped while handshaking");
                }
                None
            }
            Some(Command::External(message)) => {
                let Phase::Connected(ctx) = phase else {
                    debug!("external message ignored while handshaking");
                    return None;
                };
                let ctx = ctx.clone();
                let Some(s) = state.take() else {
                    return Some(SessionEnd::HandlerFailed(MISSING_STATE.into()));
                };
                // The external message moves into the callback; render its
                // description up front for the failure record.
                let described = format!("{message:?}");
                let directive = match guard::<H, _, _, _>(
                    "on_external",
                    move || described,
                    self.handler.on_external(message, &ctx, s),
                )
                .await
                {
                    Ok(directive) => directive,
                    Err(panic) => return Some(SessionEnd::HandlerFailed(panic)),
                };
                self.apply_frame_directive(directive, stream, codec, out, state)
                    .await
            }
            Some(Command::Shutdown) | None => {
                if let Phase::Connected(ctx) = phase {
                    let reason = CloseReason::normal();
                    let _ = write_frame(
                        stream,
                        codec,
                        out,
                        &Frame::close(Some(&reason)),
                        &self.metrics,
                    )
                    .await;
                    let ctx = ctx.clone();
                    self.notify_terminate(&TerminateReason::Shutdown, Some(&ctx), state)
                        .await;
                } else {
                    self.notify_terminate(&TerminateReason::Shutdown, None, state).await;
                }
                Some(SessionEnd::Stopped)
            }
        }
    }

    async fn notify_terminate(
        &mut self,
        reason: &TerminateReason,
        ctx: Option<&ConnContext>,
        state: &mut Option<H::State>,
    ) {
        let _ = guard::<H, _, _, _>(
            "on_terminate",
            || format!("{reason:?}"),
            self.handler.on_terminate(reason, ctx, state.as_ref()),
        )
        .await;
    }

    fn fail_pending_connects(&mut self, error: &SockwaveError) {
        for waiter in self.pending_connects.drain(..) {
            let _ = waiter.send(Err(clone_error(error)));
        }
    }
}

// ============================================================================
// Keepalive timer
// ============================================================================

/// Interval timer plus missed-ping accounting.
struct KeepaliveTimer {
    interval: Option<Interval>,
    period: Option<Duration>,
    attempts: u32,
    max_attempts: u32,
}

impl KeepaliveTimer {
    fn new(period: Option<Duration>, max_attempts: u32) -> Self {
        let mut timer = Self {
            interval: None,
            period: None,
            attempts: 0,
            max_attempts,
        };
        timer.rearm(period);
        timer
    }

    fn rearm(&mut self, period: Option<Duration>) {
        self.period = period;
        self.attempts = 0;
        self.interval = period.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            // Late ticks must not burst; the accounting assumes one tick per
            // period.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
    }

    fn period(&self) -> Option<Duration> {
        self.period
    }

    fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Count one tick without an intervening inbound frame. True when the
    /// tolerance is exhausted.
    fn register_miss(&mut self) -> bool {
        self.attempts += 1;
        self.attempts > self.max_attempts
    }

    /// Resolves on the next tick; pending forever when keepalive is off.
    async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn write_frame<S>(
    stream: &mut S,
    codec: &mut FrameCodec,
    out: &mut BytesMut,
    frame: &Frame,
    metrics: &AtomicMetrics,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    out.clear();
    codec
        .encode(frame, out)
        .map_err(|v| SockwaveError::ProtocolViolation {
            code: v.code,
            reason: v.reason.to_string(),
        })?;
    stream.write_all(out).await?;
    metrics.increment_sent();
    Ok(())
}

fn message_to_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::text(text),
        Message::Binary(data) => Frame::binary(data),
        Message::Ping(data) => Frame::ping(data),
        Message::Pong(data) => Frame::pong(data),
    }
}

fn frame_to_message(frame: &Frame) -> Option<Message> {
    match frame.opcode {
        Opcode::Text => Some(Message::Text(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
        Opcode::Binary => Some(Message::Binary(frame.payload.to_vec())),
        Opcode::Ping => Some(Message::Ping(frame.payload.to_vec())),
        Opcode::Pong => Some(Message::Pong(frame.payload.to_vec())),
        Opcode::Close | Opcode::Continuation => None,
    }
}

fn reason_to_error(reason: &DisconnectReason) -> SockwaveError {
    match reason {
        DisconnectReason::ConnectFailed(e) => SockwaveError::TransportConnect(e.clone()),
        DisconnectReason::HandshakeFailed(e) => SockwaveError::HandshakeRejected(e.clone()),
        DisconnectReason::KeepaliveTimeout => SockwaveError::KeepaliveTimeout,
        DisconnectReason::RemoteClosed { code, reason } => SockwaveError::RemoteClosed {
            code: *code,
            reason: reason.clone(),
        },
        DisconnectReason::ProtocolViolation { code, reason } => SockwaveError::ProtocolViolation {
            code: *code,
            reason: reason.clone(),
        },
        DisconnectReason::LocalClosed
        | DisconnectReason::TransportClosed
        | DisconnectReason::TransportError(_) => SockwaveError::Disconnected,
    }
}

fn clone_error(error: &SockwaveError) -> SockwaveError {
    match error {
        SockwaveError::UrlInvalid(e) => SockwaveError::UrlInvalid(e.clone()),
        SockwaveError::TransportConnect(e) => SockwaveError::TransportConnect(e.clone()),
        SockwaveError::Tls(e) => SockwaveError::Tls(e.clone()),
        SockwaveError::HandshakeRejected(e) => SockwaveError::HandshakeRejected(e.clone()),
        SockwaveError::ProtocolViolation { code, reason } => SockwaveError::ProtocolViolation {
            code: *code,
            reason: reason.clone(),
        },
        SockwaveError::KeepaliveTimeout => SockwaveError::KeepaliveTimeout,
        SockwaveError::RemoteClosed { code, reason } => SockwaveError::RemoteClosed {
            code: *code,
            reason: reason.clone(),
        },
        SockwaveError::HandlerFailure(e) => SockwaveError::HandlerFailure(e.clone()),
        SockwaveError::ChannelSend(e) => SockwaveError::ChannelSend(e.clone()),
        SockwaveError::TransportIo(_) | SockwaveError::Disconnected => SockwaveError::Disconnected,
    }
}

/// Run a handler callback, turning a panic into a structured error record:
/// callback name, handler type, the event being dispatched, and the panic
/// message. `detail` is only rendered when the callback actually panics.
async fn guard<H, F, O, D>(
    callback: &'static str,
    detail: D,
    fut: F,
) -> std::result::Result<O, String>
where
    H: Handler,
    F: Future<Output = O>,
    D: FnOnce() -> String,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            error!(
                callback,
                handler = std::any::type_name::<H>(),
                last_event = %detail(),
                panic = %panic,
                "handler callback panicked; stopping engine"
            );
            Err(format!("{callback} panicked: {panic}"))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
