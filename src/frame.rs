//! RFC 6455 frame codec
//!
//! Encoding and incremental decoding of WebSocket frames, including client-side
//! masking, fragmentation reassembly and control-frame validation.
//!
//! The decoder is a step function over a caller-owned buffer: it consumes
//! exactly the bytes of complete frames and leaves partial frames in place, so
//! arbitrary TCP segmentation never changes the yielded frame sequence.
//! Fragmented data messages are reassembled internally and surface as a single
//! logical frame; control frames interleaved with fragments pass through
//! immediately without disturbing the reassembly state.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message
    Continuation = 0x0,
    /// UTF-8 text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close control frame
    Close = 0x8,
    /// Ping control frame
    Ping = 0x9,
    /// Pong control frame
    Pong = 0xA,
}

impl Opcode {
    /// True for Close, Ping and Pong.
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A single logical WebSocket frame.
///
/// Frames yielded by the decoder always have `fin = true`: fragmented messages
/// are reassembled before they surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// Build a close frame from an optional status code and reason.
    pub fn close(reason: Option<&CloseReason>) -> Self {
        let payload = reason.map(CloseReason::to_payload).unwrap_or_default();
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }
}

/// Well-known close status codes (RFC 6455 Section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    Unsupported = 1003,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    MandatoryExtension = 1010,
    InternalError = 1011,
}

impl CloseCode {
    /// Whether a raw status code may legally appear in a close frame.
    ///
    /// Allowed per RFC 6455: 1000-1003, 1007-1011, plus the registered
    /// (3000-3999) and private (4000-4999) ranges. 1005/1006/1015 are
    /// reserved for local reporting and must never be on the wire.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// Parsed close frame payload: optional status code plus optional UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    pub code: Option<u16>,
    pub text: Option<String>,
}

impl CloseReason {
    pub fn new(code: u16, text: Option<&str>) -> Self {
        Self {
            code: Some(code),
            text: text.map(String::from),
        }
    }

    pub fn normal() -> Self {
        Self::new(CloseCode::Normal.into(), None)
    }

    /// Decode a close payload. Assumes the payload already passed the
    /// decoder's close validation; an empty payload yields an empty reason.
    pub fn parse(payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self::default();
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let text = if payload.len() > 2 {
            std::str::from_utf8(&payload[2..]).ok().map(String::from)
        } else {
            None
        };
        Self {
            code: Some(code),
            text,
        }
    }

    /// Encode as a close frame payload: big-endian code then UTF-8 reason.
    pub fn to_payload(&self) -> Bytes {
        let Some(code) = self.code else {
            return Bytes::new();
        };
        let text = self.text.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(2 + text.len());
        buf.put_u16(code);
        buf.put_slice(text.as_bytes());
        buf.freeze()
    }
}

/// A framing-rule violation, carrying the close code to answer with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol violation ({code}): {reason}")]
pub struct ProtocolViolation {
    pub code: u16,
    pub reason: &'static str,
}

impl ProtocolViolation {
    fn protocol(reason: &'static str) -> Self {
        Self {
            code: CloseCode::ProtocolError.into(),
            reason,
        }
    }

    fn invalid_payload(reason: &'static str) -> Self {
        Self {
            code: CloseCode::InvalidPayload.into(),
            reason,
        }
    }

    fn too_big(reason: &'static str) -> Self {
        Self {
            code: CloseCode::MessageTooBig.into(),
            reason,
        }
    }
}

/// Role in the connection. Clients must mask every outgoing frame and must
/// reject masked frames from the server; servers are the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A wire frame before fragmentation reassembly.
#[derive(Debug)]
struct RawFrame {
    fin: bool,
    opcode: Opcode,
    payload: BytesMut,
}

/// WebSocket frame codec.
///
/// Stateful only for the fragmented-message accumulator; everything else is
/// re-derived per frame from the caller's buffer.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
    max_message_size: usize,
    /// Opcode and accumulated payload of an in-progress fragmented message.
    fragment: Option<(Opcode, BytesMut)>,
}

impl FrameCodec {
    /// Default limit for a single frame payload (16 MiB).
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Default limit for a reassembled message (64 MiB).
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: Self::DEFAULT_MAX_MESSAGE_SIZE,
            fragment: None,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Encode one frame into `dst`.
    ///
    /// Client-role codecs set the mask bit and draw a fresh 4-byte key per
    /// frame; the payload is XOR-masked in place in the output buffer.
    pub fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolViolation> {
        let len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(ProtocolViolation::protocol(
                    "control frames cannot be fragmented",
                ));
            }
            if len > 125 {
                return Err(ProtocolViolation::protocol(
                    "control frame payload exceeds 125 bytes",
                ));
            }
        }

        let masked = self.role == Role::Client;
        dst.reserve(14 + len);

        let mut first = frame.opcode as u8;
        if frame.fin {
            first |= 0x80;
        }
        dst.put_u8(first);

        let mask_bit = if masked { 0x80 } else { 0x00 };
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if masked {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }

    /// Decode the next logical frame out of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; unconsumed bytes stay in
    /// `src`. Control frames are yielded as soon as they are complete, data
    /// frames only once the final fragment has arrived.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolViolation> {
        loop {
            let Some(raw) = self.decode_raw(src)? else {
                return Ok(None);
            };
            if let Some(frame) = self.assemble(raw)? {
                return Ok(Some(frame));
            }
            // A non-final fragment was absorbed; try the next wire frame.
        }
    }

    fn decode_raw(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolViolation> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(ProtocolViolation::protocol(
                "reserved bits set without a negotiated extension",
            ));
        }
        let opcode = Opcode::from_u8(first & 0x0F)
            .ok_or_else(|| ProtocolViolation::protocol("reserved opcode"))?;

        let masked = second & 0x80 != 0;
        match self.role {
            Role::Client if masked => {
                return Err(ProtocolViolation::protocol("masked frame from server"))
            }
            Role::Server if !masked => {
                return Err(ProtocolViolation::protocol("unmasked frame from client"))
            }
            _ => {}
        }

        let len7 = (second & 0x7F) as usize;
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolViolation::protocol("fragmented control frame"));
            }
            if len7 > 125 {
                return Err(ProtocolViolation::protocol(
                    "control frame payload exceeds 125 bytes",
                ));
            }
        }

        // Non-canonical length encodings (16-bit form for <=125, 64-bit form
        // for <=65535) are tolerated for interoperability.
        let (payload_len, ext_len) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                (
                    u64::from_be_bytes([
                        src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9],
                    ]),
                    8,
                )
            }
            n => (n as u64, 0),
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(ProtocolViolation::too_big("frame payload exceeds limit"));
        }
        let payload_len = payload_len as usize;

        let header_len = 2 + ext_len + if masked { 4 } else { 0 };
        if src.len() < header_len + payload_len {
            return Ok(None);
        }

        src.advance(2 + ext_len);
        let mask_key = if masked {
            let key = [src[0], src[1], src[2], src[3]];
            src.advance(4);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(RawFrame {
            fin,
            opcode,
            payload,
        }))
    }

    fn assemble(&mut self, raw: RawFrame) -> Result<Option<Frame>, ProtocolViolation> {
        if raw.opcode.is_control() {
            if raw.opcode == Opcode::Close {
                validate_close_payload(&raw.payload)?;
            }
            return Ok(Some(Frame {
                fin: true,
                opcode: raw.opcode,
                payload: raw.payload.freeze(),
            }));
        }

        if raw.opcode == Opcode::Continuation {
            let Some((opcode, mut acc)) = self.fragment.take() else {
                return Err(ProtocolViolation::protocol(
                    "continuation frame with no message in progress",
                ));
            };
            if acc.len() + raw.payload.len() > self.max_message_size {
                return Err(ProtocolViolation::too_big(
                    "reassembled message exceeds limit",
                ));
            }
            acc.extend_from_slice(&raw.payload);
            if !raw.fin {
                self.fragment = Some((opcode, acc));
                return Ok(None);
            }
            let payload = acc.freeze();
            if opcode == Opcode::Text {
                validate_utf8(&payload)?;
            }
            return Ok(Some(Frame {
                fin: true,
                opcode,
                payload,
            }));
        }

        // Text or Binary
        if self.fragment.is_some() {
            return Err(ProtocolViolation::protocol(
                "data frame while a fragmented message is in progress",
            ));
        }
        if raw.fin {
            let payload = raw.payload.freeze();
            if raw.opcode == Opcode::Text {
                validate_utf8(&payload)?;
            }
            Ok(Some(Frame {
                fin: true,
                opcode: raw.opcode,
                payload,
            }))
        } else {
            self.fragment = Some((raw.opcode, raw.payload));
            Ok(None)
        }
    }
}

fn validate_utf8(payload: &[u8]) -> Result<(), ProtocolViolation> {
    std::str::from_utf8(payload)
        .map(|_| ())
        .map_err(|_| ProtocolViolation::invalid_payload("invalid UTF-8 in text message"))
}

fn validate_close_payload(payload: &[u8]) -> Result<(), ProtocolViolation> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(ProtocolViolation::protocol(
            "close frame with 1-byte payload",
        )),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid_code(code) {
                return Err(ProtocolViolation::protocol("invalid close status code"));
            }
            std::str::from_utf8(&payload[2..])
                .map(|_| ())
                .map_err(|_| ProtocolViolation::invalid_payload("invalid UTF-8 in close reason"))
        }
    }
}

/// XOR the payload with a 4-byte mask key, in place. Masking and unmasking
/// are the same operation.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut encoder = FrameCodec::client();
        let mut decoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        encoder.encode(&frame, &mut buf).unwrap();
        decoder.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn roundtrip_text() {
        let parsed = roundtrip(Frame::text("hello"));
        assert_eq!(parsed.opcode, Opcode::Text);
        assert_eq!(parsed.payload.as_ref(), b"hello");
        assert!(parsed.fin);
    }

    #[test]
    fn roundtrip_binary_empty() {
        let parsed = roundtrip(Frame::binary(Bytes::new()));
        assert_eq!(parsed.opcode, Opcode::Binary);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn roundtrip_extended_lengths() {
        // 2-byte length form
        let parsed = roundtrip(Frame::binary(vec![7u8; 300]));
        assert_eq!(parsed.payload.len(), 300);
        // 8-byte length form
        let parsed = roundtrip(Frame::binary(vec![7u8; 70_000]));
        assert_eq!(parsed.payload.len(), 70_000);
        // 1 MiB payload
        let parsed = roundtrip(Frame::binary(vec![7u8; 1 << 20]));
        assert_eq!(parsed.payload.len(), 1 << 20);
    }

    #[test]
    fn client_frames_are_masked() {
        let mut encoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        encoder.encode(&Frame::text("masked"), &mut buf).unwrap();
        assert!(buf[1] & 0x80 != 0);

        // Two encodings of the same payload should produce different bytes
        // because the mask key is fresh per frame.
        let mut other = BytesMut::new();
        encoder.encode(&Frame::text("masked"), &mut other).unwrap();
        assert_ne!(buf[2..6], other[2..6]);
    }

    #[test]
    fn server_frames_are_not_masked() {
        let mut encoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        encoder.encode(&Frame::text("plain"), &mut buf).unwrap();
        assert_eq!(buf[1] & 0x80, 0);
        assert_eq!(&buf[2..], b"plain");
    }

    #[test]
    fn masked_server_frame_rejected() {
        // A client-role decoder must reject masked (server->client) frames.
        let mut encoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        encoder.encode(&Frame::text("oops"), &mut buf).unwrap();

        let mut decoder = FrameCodec::client();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
        assert!(err.reason.contains("masked"));
    }

    #[test]
    fn unmasked_client_frame_rejected() {
        let mut encoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        encoder.encode(&Frame::text("oops"), &mut buf).unwrap();

        let mut decoder = FrameCodec::server();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::from(&[0xC1u8, 0x00][..]); // FIN + RSV1, text, empty
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
        assert!(err.reason.contains("reserved bits"));
    }

    #[test]
    fn reserved_opcode_rejected() {
        for op in [0x3u8, 0x7, 0xB, 0xF] {
            let mut decoder = FrameCodec::client();
            let mut buf = BytesMut::from(&[0x80 | op, 0x00][..]);
            let err = decoder.decode(&mut buf).unwrap_err();
            assert_eq!(err.code, 1002);
        }
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let mut decoder = FrameCodec::client();
        // Ping with 7-bit length 126 escapes into the extended form, which is
        // illegal for control frames.
        let mut buf = BytesMut::from(&[0x89u8, 126, 0x00, 0x80][..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
        assert!(err.reason.contains("control frame"));
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::from(&[0x09u8, 0x00][..]); // ping without FIN
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
    }

    #[test]
    fn stray_continuation_rejected() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::from(&[0x80u8, 0x03, b'a', b'b', b'c'][..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
        assert!(err.reason.contains("continuation"));
    }

    #[test]
    fn data_frame_inside_fragment_rejected() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x02, b'h', b'i']); // text, no FIN
        buf.extend_from_slice(&[0x81, 0x02, b'n', b'o']); // new text before FIN
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
    }

    #[test]
    fn invalid_utf8_text_rejected() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::from(&[0x81u8, 0x02, 0xC3, 0x28][..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1007);
    }

    #[test]
    fn invalid_close_codes_rejected() {
        for code in [999u16, 1004, 1005, 1006, 1015, 2999, 5000] {
            let mut decoder = FrameCodec::client();
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&[0x88, 0x02]);
            buf.extend_from_slice(&code.to_be_bytes());
            let err = decoder.decode(&mut buf).unwrap_err();
            assert_eq!(err.code, 1002, "code {code} should be rejected");
        }
    }

    #[test]
    fn valid_close_codes_accepted() {
        for code in [1000u16, 1001, 1002, 1011, 3000, 4999] {
            let mut decoder = FrameCodec::client();
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&[0x88, 0x02]);
            buf.extend_from_slice(&code.to_be_bytes());
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.opcode, Opcode::Close);
            assert_eq!(CloseReason::parse(&frame.payload).code, Some(code));
        }
    }

    #[test]
    fn one_byte_close_payload_rejected() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::from(&[0x88u8, 0x01, 0x03][..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1002);
    }

    #[test]
    fn non_canonical_lengths_accepted() {
        let mut decoder = FrameCodec::client();
        // 16-bit form carrying a length that fits 7 bits
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x82, 126, 0x00, 0x03, 1, 2, 3]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), &[1, 2, 3]);

        // 64-bit form carrying a length that fits 16 bits
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x82, 127]);
        buf.extend_from_slice(&3u64.to_be_bytes());
        buf.extend_from_slice(&[4, 5, 6]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), &[4, 5, 6]);
    }

    #[test]
    fn fragments_reassemble() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x03, b'h', b'e', b'l']); // text, no FIN
        buf.extend_from_slice(&[0x00, 0x03, b'l', b'o', b' ']); // continuation, no FIN
        buf.extend_from_slice(&[0x80, 0x05, b'w', b'o', b'r', b'l', b'd']); // continuation, FIN

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x03, b'h', b'e', b'l']);
        buf.extend_from_slice(&[0x89, 0x02, 0x01, 0x02]); // ping mid-message
        buf.extend_from_slice(&[0x80, 0x02, b'l', b'o']);

        let ping = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert_eq!(ping.payload.as_ref(), &[0x01, 0x02]);

        let text = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(text.opcode, Opcode::Text);
        assert_eq!(text.payload.as_ref(), b"hello");
    }

    #[test]
    fn utf8_split_across_fragments_is_accepted() {
        // U+00E9 is 0xC3 0xA9; split the code point between two fragments.
        let mut decoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x01, 0xC3]);
        buf.extend_from_slice(&[0x80, 0x01, 0xA9]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), "é".as_bytes());
    }

    #[test]
    fn partial_frames_need_more_bytes() {
        let mut encoder = FrameCodec::client();
        let mut full = BytesMut::new();
        encoder
            .encode(&Frame::text("partial read"), &mut full)
            .unwrap();

        let mut decoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = decoder.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "yielded early at byte {i}");
            } else {
                let frame = decoded.unwrap();
                assert_eq!(frame.payload.as_ref(), b"partial read");
            }
        }
    }

    #[test]
    fn leftover_bytes_stay_in_buffer() {
        let mut encoder = FrameCodec::server();
        let mut buf = BytesMut::new();
        encoder.encode(&Frame::text("one"), &mut buf).unwrap();
        encoder.encode(&Frame::text("two"), &mut buf).unwrap();

        let mut decoder = FrameCodec::client();
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"one");
        assert!(!buf.is_empty());
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_rejects_bad_control_frames() {
        let mut codec = FrameCodec::client();
        let mut buf = BytesMut::new();

        let oversized = Frame::ping(vec![0u8; 126]);
        assert!(codec.encode(&oversized, &mut buf).is_err());

        let mut fragmented = Frame::ping("x");
        fragmented.fin = false;
        assert!(codec.encode(&fragmented, &mut buf).is_err());
    }

    #[test]
    fn frame_size_limit_enforced() {
        let mut decoder = FrameCodec::client().max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x82, 17]);
        buf.extend_from_slice(&[0u8; 17]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.code, 1009);
    }

    #[test]
    fn apply_mask_is_involutive() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let mut payload = b"mask me twice".to_vec();
        let original = payload.clone();
        apply_mask(&mut payload, key);
        assert_ne!(payload, original);
        apply_mask(&mut payload, key);
        assert_eq!(payload, original);
    }

    #[test]
    fn close_reason_roundtrip() {
        let reason = CloseReason::new(1000, Some("bye"));
        let payload = reason.to_payload();
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"bye");
        assert_eq!(CloseReason::parse(&payload), reason);

        assert_eq!(CloseReason::parse(&[]), CloseReason::default());
        assert_eq!(CloseReason::default().to_payload(), Bytes::new());
    }

    fn arb_opcode() -> impl Strategy<Value = Opcode> {
        prop_oneof![
            Just(Opcode::Text),
            Just(Opcode::Binary),
            Just(Opcode::Ping),
            Just(Opcode::Pong),
        ]
    }

    proptest! {
        #[test]
        fn prop_roundtrip_preserves_opcode_and_payload(
            opcode in arb_opcode(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            // Control frames are capped at 125 bytes; text must be UTF-8.
            prop_assume!(!opcode.is_control() || payload.len() <= 125);
            prop_assume!(opcode != Opcode::Text || std::str::from_utf8(&payload).is_ok());

            let frame = Frame { fin: true, opcode, payload: payload.clone().into() };
            let mut encoder = FrameCodec::client();
            let mut decoder = FrameCodec::server();
            let mut buf = BytesMut::new();
            encoder.encode(&frame, &mut buf).unwrap();
            let parsed = decoder.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(parsed.opcode, opcode);
            prop_assert_eq!(parsed.payload.as_ref(), &payload[..]);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_segmentation_invariance(
            payload in proptest::collection::vec(any::<u8>(), 0..1024),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut encoder = FrameCodec::client();
            let mut wire = BytesMut::new();
            encoder.encode(&Frame::binary(payload.clone()), &mut wire).unwrap();

            // Feed the same bytes in arbitrary chunks; the yielded frame must
            // be identical to the single-chunk decode.
            let mut offsets: Vec<usize> = cuts.iter().map(|ix| ix.index(wire.len())).collect();
            offsets.push(0);
            offsets.push(wire.len());
            offsets.sort_unstable();
            offsets.dedup();

            let mut decoder = FrameCodec::server();
            let mut buf = BytesMut::new();
            let mut yielded = None;
            for pair in offsets.windows(2) {
                buf.extend_from_slice(&wire[pair[0]..pair[1]]);
                if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    prop_assert!(yielded.is_none());
                    yielded = Some(frame);
                }
            }
            let frame = yielded.unwrap();
            prop_assert_eq!(frame.opcode, Opcode::Binary);
            prop_assert_eq!(frame.payload.as_ref(), &payload[..]);
        }

        #[test]
        fn prop_masked_payload_recovers_original(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            key in any::<[u8; 4]>(),
        ) {
            let mut masked = payload.clone();
            apply_mask(&mut masked, key);
            apply_mask(&mut masked, key);
            prop_assert_eq!(masked, payload);
        }

        #[test]
        fn prop_fragmented_message_reassembles(
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                1..6,
            ),
        ) {
            let mut server = FrameCodec::server();
            let mut wire = BytesMut::new();
            let total: Vec<u8> = chunks.concat();

            for (i, chunk) in chunks.iter().enumerate() {
                let opcode = if i == 0 { Opcode::Binary } else { Opcode::Continuation };
                let frame = Frame {
                    fin: i + 1 == chunks.len(),
                    opcode,
                    payload: chunk.clone().into(),
                };
                server.encode(&frame, &mut wire).unwrap();
                // A ping between fragments must not disturb reassembly.
                server.encode(&Frame::ping("hb"), &mut wire).unwrap();
            }

            let mut decoder = FrameCodec::client();
            let mut pings = 0;
            let mut data = None;
            while let Some(frame) = decoder.decode(&mut wire).unwrap() {
                match frame.opcode {
                    Opcode::Ping => pings += 1,
                    Opcode::Binary => {
                        prop_assert!(data.is_none());
                        data = Some(frame.payload);
                    }
                    other => prop_assert!(false, "unexpected opcode {:?}", other),
                }
            }
            prop_assert_eq!(pings, chunks.len());
            let data = data.unwrap();
            prop_assert_eq!(data.as_ref(), &total[..]);
        }
    }
}
