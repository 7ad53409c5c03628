//! # sockwave
//!
//! A client-side WebSocket (RFC 6455) engine built around an explicit
//! connection lifecycle state machine.
//!
//! ## Features
//!
//! - **Explicit lifecycle**: Disconnected / Handshaking / Connected, driven by
//!   a single cooperative loop per engine with no locks around connection state
//! - **Own wire layer**: frame codec with client masking, fragmentation
//!   reassembly and strict control-frame validation; HTTP upgrade handshake
//!   with `Sec-WebSocket-Accept` verification
//! - **Keepalive**: automatic pings with missed-ping accounting; a dead peer
//!   is detected after a configurable number of silent intervals
//! - **Handler-directed reconnection**: the handler's directives decide after
//!   every disconnect whether to stay down, reconnect now, reconnect after a
//!   delay, or stop
//! - **Transparent TLS**: `wss://` via rustls, with configurable peer
//!   verification
//!
//! ## Example
//!
//! ```ignore
//! use sockwave::{Engine, Handler, Init, Message, OnConnect, OnDisconnect, OnFrame};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     type State = u64;
//!     type External = ();
//!
//!     async fn init(&mut self) -> Init<u64> {
//!         Init::ConnectOnce(0)
//!     }
//!
//!     async fn on_connect(&mut self, _ctx: &sockwave::ConnContext, state: u64) -> OnConnect<u64> {
//!         OnConnect::Reply(Message::text("hello"), state)
//!     }
//!
//!     async fn on_disconnect(
//!         &mut self,
//!         _reason: &sockwave::DisconnectReason,
//!         state: u64,
//!     ) -> OnDisconnect<u64> {
//!         OnDisconnect::Idle(state)
//!     }
//!
//!     async fn on_frame(
//!         &mut self,
//!         message: &Message,
//!         _ctx: &sockwave::ConnContext,
//!         state: u64,
//!     ) -> OnFrame<u64> {
//!         println!("got {message:?}");
//!         OnFrame::Continue(state + 1)
//!     }
//! }
//!
//! # async fn run() -> sockwave::Result<()> {
//! let engine = Engine::start("ws://example.com/echo", Echo)?;
//! engine.send(Message::text("ping me"))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod state;
pub mod transport;

pub use config::ClientConfig;
pub use engine::{Engine, EngineEvent};
pub use error::{Result, SockwaveError};
pub use frame::{apply_mask, CloseCode, CloseReason, Frame, FrameCodec, Opcode, Role};
pub use handler::{
    ConnContext, DisconnectReason, Handler, Init, Message, OnConnect, OnDisconnect, OnFrame,
    TerminateReason,
};
pub use handshake::{compute_accept_key, ClientHandshake, WsUrl};
pub use state::{Lifecycle, Metrics};
pub use transport::{MaybeTlsStream, TcpTransport, TlsVerify, Transport};
