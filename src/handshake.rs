//! HTTP upgrade handshake (RFC 6455 Section 4)
//!
//! Builds the client upgrade request and validates the server's 101 response
//! against the generated `Sec-WebSocket-Key`. Response validation is
//! incremental: bytes are accumulated until the `\r\n\r\n` terminator and any
//! trailing bytes are left in the buffer for the frame codec.

use crate::error::{Result, SockwaveError};
use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the server's response head before we give up.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Compute the expected `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(key ++ GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let digest = Sha1::digest(format!("{client_key}{WS_GUID}").as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Generate a fresh handshake key: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// A parsed `ws://` / `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    /// Request path including the query string, never empty.
    pub path: String,
    /// True for `wss://`.
    pub secure: bool,
}

impl WsUrl {
    /// Parse a WebSocket URL. Only `ws` and `wss` schemes are accepted;
    /// the port defaults to 80/443 and the path to `/`.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| SockwaveError::UrlInvalid("missing scheme".into()))?;

        let secure = match scheme {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(SockwaveError::UrlInvalid(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };

        let default_port = if secure { 443 } else { 80 };

        // Split authority from path+query. A query with no path still needs
        // a leading slash in the request line.
        let (authority, path) = match (rest.find('/'), rest.find('?')) {
            (Some(slash), Some(q)) if q < slash => (&rest[..q], format!("/{}", &rest[q..])),
            (Some(slash), _) => (&rest[..slash], rest[slash..].to_string()),
            (None, Some(q)) => (&rest[..q], format!("/{}", &rest[q..])),
            (None, None) => (rest, "/".to_string()),
        };

        let (host, port) = if let Some(bracket_end) = authority.find(']') {
            // IPv6 literal: [::1]:8080
            let host = authority
                .strip_prefix('[')
                .map(|h| &h[..bracket_end - 1])
                .ok_or_else(|| SockwaveError::UrlInvalid("malformed IPv6 host".into()))?;
            let port = match authority.get(bracket_end + 1..) {
                Some("") | None => default_port,
                Some(p) => p
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| SockwaveError::UrlInvalid("invalid port".into()))?,
            };
            (host.to_string(), port)
        } else if let Some(colon) = authority.rfind(':') {
            let port = authority[colon + 1..]
                .parse()
                .map_err(|_| SockwaveError::UrlInvalid("invalid port".into()))?;
            (authority[..colon].to_string(), port)
        } else {
            (authority.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(SockwaveError::UrlInvalid("empty host".into()));
        }

        Ok(Self {
            host,
            port,
            path,
            secure,
        })
    }

    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Outcome of a validated 101 response.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    /// `Sec-WebSocket-Protocol` echoed by the server, if any.
    pub subprotocol: Option<String>,
}

/// One client handshake attempt. A fresh key is generated per instance, so a
/// reconnecting engine creates a new `ClientHandshake` for every attempt.
#[derive(Debug)]
pub struct ClientHandshake {
    host_header: String,
    path: String,
    key: String,
    subprotocol: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl ClientHandshake {
    pub fn new(url: &WsUrl, subprotocol: Option<&str>, extra_headers: &[(String, String)]) -> Self {
        Self {
            host_header: url.host_header(),
            path: url.path.clone(),
            key: generate_key(),
            subprotocol: subprotocol.map(String::from),
            extra_headers: dedupe_headers(extra_headers),
        }
    }

    /// The generated `Sec-WebSocket-Key` for this attempt.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialize the HTTP/1.1 upgrade request.
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            self.path, self.host_header, self.key
        );

        if let Some(protocol) = &self.subprotocol {
            request.push_str("Sec-WebSocket-Protocol: ");
            request.push_str(protocol);
            request.push_str("\r\n");
        }

        for (name, value) in &self.extra_headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }

        request.push_str("\r\n");
        request.into_bytes()
    }

    /// Try to complete the handshake from accumulated bytes.
    ///
    /// Returns `Ok(None)` until the `\r\n\r\n` terminator has arrived. On
    /// completion, exactly the response head is consumed from `buf`; any
    /// bytes past the terminator are the start of the frame stream and stay
    /// in the buffer.
    pub fn read_response(&self, buf: &mut BytesMut) -> Result<Option<Negotiated>> {
        let Some(head_end) = find_terminator(buf) else {
            if buf.len() > MAX_RESPONSE_HEAD {
                return Err(SockwaveError::HandshakeRejected(
                    "response head too large".into(),
                ));
            }
            return Ok(None);
        };

        let head = buf.split_to(head_end + 4);
        let response = ResponseHead::parse(&head)?;

        if response.status != 101 {
            return Err(SockwaveError::HandshakeRejected(format!(
                "expected 101 Switching Protocols, got {} {}",
                response.status, response.reason
            )));
        }

        let upgrade = response
            .header("upgrade")
            .ok_or_else(|| SockwaveError::HandshakeRejected("missing Upgrade header".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(SockwaveError::HandshakeRejected(format!(
                "Upgrade header must be 'websocket', got '{upgrade}'"
            )));
        }

        let connection = response
            .header("connection")
            .ok_or_else(|| SockwaveError::HandshakeRejected("missing Connection header".into()))?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(SockwaveError::HandshakeRejected(format!(
                "Connection header must contain 'Upgrade', got '{connection}'"
            )));
        }

        let accept = response.header("sec-websocket-accept").ok_or_else(|| {
            SockwaveError::HandshakeRejected("missing Sec-WebSocket-Accept header".into())
        })?;
        let expected = compute_accept_key(&self.key);
        if accept != expected {
            return Err(SockwaveError::HandshakeRejected(format!(
                "Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"
            )));
        }

        Ok(Some(Negotiated {
            subprotocol: response.header("sec-websocket-protocol").map(String::from),
        }))
    }
}

/// Last-wins de-duplication of user headers by case-insensitive name.
fn dedupe_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        if let Some(existing) = out.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            existing.1 = value.clone();
        } else {
            out.push((name.clone(), value.clone()));
        }
    }
    out
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Minimal parsed HTTP response head.
struct ResponseHead {
    status: u16,
    reason: String,
    headers: HashMap<String, String>,
}

impl ResponseHead {
    fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| {
            SockwaveError::HandshakeRejected("response head is not valid UTF-8".into())
        })?;

        let mut lines = text.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| SockwaveError::HandshakeRejected("empty response".into()))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| SockwaveError::HandshakeRejected("missing HTTP version".into()))?;
        if !version.starts_with("HTTP/1.1") {
            return Err(SockwaveError::HandshakeRejected(format!(
                "unexpected HTTP version '{version}'"
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| SockwaveError::HandshakeRejected("invalid status code".into()))?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
