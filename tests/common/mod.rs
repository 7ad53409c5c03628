//! Common test utilities for sockwave integration tests
//!
//! Provides a mock WebSocket server speaking raw RFC 6455 through the
//! crate's own server-role codec, with scriptable per-connection behavior.

use bytes::BytesMut;
use sockwave::frame::{CloseReason, Frame, FrameCodec, Opcode};
use sockwave::handshake::compute_accept_key;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// Initialize test logging once; `RUST_LOG` controls verbosity.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a mock connection does after the upgrade.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Echo data frames, answer pings with pongs.
    Echo,
    /// Run the scripted actions, then keep reading and recording.
    Script(Vec<ServerAction>),
    /// Refuse the upgrade with an HTTP error.
    Reject { status: u16, reason: &'static str },
    /// Complete the upgrade, then read and record without ever responding.
    Silent,
}

#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Encode and send a frame (fragments allowed).
    SendFrame(Frame),
    /// Send raw bytes onto the wire.
    SendBytes(Vec<u8>),
    Wait(Duration),
    /// Send a close frame with code and reason.
    Close { code: u16, reason: &'static str },
    /// Drop the TCP connection without a close frame.
    DropConnection,
}

/// A mock WebSocket server bound to an ephemeral port. Every accepted
/// connection runs the same behavior; frames received from the client are
/// recorded and exposed through [`recv_frame`](MockWsServer::recv_frame).
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    connections: Arc<AtomicUsize>,
    received: UnboundedReceiver<Frame>,
}

impl MockWsServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let connections = Arc::new(AtomicUsize::new(0));
        let (frames_tx, frames_rx) = unbounded_channel();

        let shutdown_accept = Arc::clone(&shutdown);
        let connections_accept = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        connections_accept.fetch_add(1, Ordering::SeqCst);
                        let behavior = behavior.clone();
                        let frames = frames_tx.clone();
                        let shutdown = Arc::clone(&shutdown_accept);
                        tokio::spawn(async move {
                            handle_connection(stream, behavior, frames, shutdown).await;
                        });
                    }
                    _ = shutdown_accept.notified() => break,
                }
            }
        });

        Self {
            addr,
            shutdown,
            connections,
            received: frames_rx,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of TCP connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next frame received from a client, with a test timeout.
    pub async fn recv_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for a frame from the client")
            .expect("server frame channel closed")
    }

    /// Wait until at least `n` connections have been accepted.
    pub async fn wait_for_connections(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connection_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} connections"));
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    behavior: Behavior,
    frames: UnboundedSender<Frame>,
    shutdown: Arc<Notify>,
) {
    // Read the upgrade request head.
    let mut buf = BytesMut::with_capacity(2048);
    let head = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break buf.split_to(pos + 4);
        }
        buf.reserve(1024);
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    };
    let head = String::from_utf8_lossy(&head).into_owned();

    if let Behavior::Reject { status, reason } = behavior {
        let response = format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\n\r\n");
        let _ = stream.write_all(response.as_bytes()).await;
        return;
    }

    let Some(key) = header_value(&head, "sec-websocket-key") else {
        return;
    };
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        compute_accept_key(&key)
    );
    if let Some(protocol) = header_value(&head, "sec-websocket-protocol") {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    let mut codec = FrameCodec::server();
    let mut out = BytesMut::new();

    match behavior {
        Behavior::Reject { .. } => unreachable!("handled above"),
        Behavior::Script(actions) => {
            for action in actions {
                match action {
                    ServerAction::SendFrame(frame) => {
                        out.clear();
                        codec.encode(&frame, &mut out).unwrap();
                        if stream.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                    ServerAction::SendBytes(bytes) => {
                        if stream.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                    ServerAction::Wait(duration) => tokio::time::sleep(duration).await,
                    ServerAction::Close { code, reason } => {
                        let frame = Frame::close(Some(&CloseReason::new(code, Some(reason))));
                        out.clear();
                        codec.encode(&frame, &mut out).unwrap();
                        if stream.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                    ServerAction::DropConnection => return,
                }
            }
            read_loop(&mut stream, &mut codec, &mut buf, &frames, &shutdown, false).await;
        }
        Behavior::Silent => {
            read_loop(&mut stream, &mut codec, &mut buf, &frames, &shutdown, false).await;
        }
        Behavior::Echo => {
            read_loop(&mut stream, &mut codec, &mut buf, &frames, &shutdown, true).await;
        }
    }
}

/// Read, decode and record client frames; optionally echo data and answer
/// pings like a well-behaved peer.
async fn read_loop(
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    frames: &UnboundedSender<Frame>,
    shutdown: &Notify,
    respond: bool,
) {
    let mut out = BytesMut::new();
    loop {
        // Drain whatever is already buffered (e.g. bytes that arrived with
        // the request head).
        loop {
            match codec.decode(buf) {
                Ok(Some(frame)) => {
                    let _ = frames.send(frame.clone());
                    if respond {
                        let reply = match frame.opcode {
                            Opcode::Text | Opcode::Binary => Some(frame.clone()),
                            Opcode::Ping => Some(Frame::pong(frame.payload.clone())),
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            out.clear();
                            codec.encode(&reply, &mut out).unwrap();
                            if stream.write_all(&out).await.is_err() {
                                return;
                            }
                        }
                        if frame.opcode == Opcode::Close {
                            out.clear();
                            codec.encode(&Frame::close(None), &mut out).unwrap();
                            let _ = stream.write_all(&out).await;
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }

        buf.reserve(4096);
        tokio::select! {
            read = stream.read_buf(buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            _ = shutdown.notified() => return,
        }
    }
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (header, value) = line.split_once(':')?;
        header
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}
