//! WebSocket frame codec (RFC 6455 Section 5.2)
//!
//! Translates between wire bytes and [`Frame`]s.
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  Masking-key (0 or 4 bytes)   |          Payload Data         |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Decoding checks the remaining length before every field access and reports
//! a short buffer as [`FrameError::Incomplete`]. Frames written by the server
//! are never masked.

use crate::core::error::FrameError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload representable with the 7-bit length field
const MAX_SHORT_PAYLOAD: usize = 125;
/// Length marker announcing a 16-bit extended length
const LEN_16: u8 = 126;
/// Length marker announcing a 64-bit extended length
const LEN_64: u8 = 127;

/// Default upper bound for an inbound payload (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Close status codes used by the gateway (RFC 6455 Section 7.4.1)
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// WebSocket frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Close, Ping and Pong
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A single decoded WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    pub opcode: Opcode,
    /// Mask key as received; `None` for unmasked frames
    pub mask_key: Option<[u8; 4]>,
    /// Payload bytes, already unmasked
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked text frame
    pub fn text(payload: impl Into<String>) -> Self {
        Self::server(Opcode::Text, payload.into().into_bytes())
    }

    /// A pong answering a ping with the same application data
    pub fn pong(payload: Vec<u8>) -> Self {
        Self::server(Opcode::Pong, payload)
    }

    /// A close frame, optionally echoing the peer's status code
    pub fn close(payload: Vec<u8>) -> Self {
        Self::server(Opcode::Close, payload)
    }

    /// A close frame carrying only a status code
    pub fn close_with_code(code: u16) -> Self {
        Self::close(code.to_be_bytes().to_vec())
    }

    /// Status code of a close frame, if it carries one
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_slice()) {
            (Opcode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    fn server(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            mask_key: None,
            payload,
        }
    }

    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Interpret the payload as UTF-8 text
    pub fn into_text(self) -> Result<String, FrameError> {
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }

    /// Decode one frame from the start of `buf`
    ///
    /// Returns the frame together with the number of bytes it occupied, so a
    /// caller holding several pipelined frames can advance past it.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        Self::decode_with_limit(buf, usize::MAX)
    }

    /// Like [`Frame::decode`], rejecting payloads longer than `max_payload`
    /// before waiting for them to arrive.
    pub fn decode_with_limit(buf: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
        let mut offset = 0;

        let header = take(buf, &mut offset, 2)?;
        let (b0, b1) = (header[0], header[1]);

        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        let len = match b1 & 0x7F {
            LEN_16 => {
                let ext = take(buf, &mut offset, 2)?;
                u64::from(u16::from_be_bytes([ext[0], ext[1]]))
            }
            LEN_64 => {
                let ext = take(buf, &mut offset, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(ext);
                u64::from_be_bytes(raw)
            }
            short => u64::from(short),
        };

        if opcode.is_control() && (!fin || len > MAX_SHORT_PAYLOAD as u64) {
            return Err(FrameError::InvalidControlFrame { size: len });
        }
        if len > max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: max_payload,
            });
        }
        let len = usize::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        })?;

        let mask_key = if masked {
            let key = take(buf, &mut offset, 4)?;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        let mut payload = take(buf, &mut offset, len)?.to_vec();
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok((
            Frame {
                fin,
                opcode,
                mask_key,
                payload,
            },
            offset,
        ))
    }

    /// Serialize this frame for sending
    ///
    /// The mask key is ignored: server frames go out unmasked.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(self.payload.len() + 10);
        self.encode_into(&mut out);
        out.to_vec()
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        let fin = if self.fin { 0x80 } else { 0x00 };
        dst.put_u8(fin | self.opcode.as_u8());

        let len = self.payload.len();
        if len <= MAX_SHORT_PAYLOAD {
            dst.put_u8(len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(LEN_16);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(LEN_64);
            dst.put_u64(len as u64);
        }

        dst.put_slice(&self.payload);
    }
}

/// Borrow `n` bytes at `offset`, advancing it, or report how many are missing
fn take<'a>(buf: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8], FrameError> {
    let available = buf.len().saturating_sub(*offset);
    if available < n {
        return Err(FrameError::Incomplete {
            needed: n - available,
        });
    }
    let slice = &buf[*offset..*offset + n];
    *offset += n;
    Ok(slice)
}

/// XOR `payload` with the 4-byte key; applying it twice restores the input
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decode a single frame from one read and return its payload as text
///
/// A buffer that ends mid-frame is an error here; streaming callers should use
/// [`FrameCodec`] instead, which waits for the rest.
pub fn decode_text(buf: &[u8]) -> Result<String, FrameError> {
    let (frame, _) = Frame::decode(buf)?;
    frame.into_text()
}

/// Encode `text` as a single final, unmasked text frame (`0x81` header)
pub fn encode_text(text: &str) -> Vec<u8> {
    Frame::text(text).encode()
}

/// Streaming codec for client connections
///
/// Buffers partial frames across reads and enforces the payload limit and
/// the client masking rule.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    require_mask: bool,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: true,
        }
    }

    /// Accept unmasked frames (useful when the peer is not a browser)
    pub fn allow_unmasked(mut self) -> Self {
        self.require_mask = false;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }

        match Frame::decode_with_limit(&src[..], self.max_payload) {
            Ok((frame, consumed)) => {
                src.advance(consumed);
                if self.require_mask && !frame.is_masked() {
                    return Err(FrameError::UnmaskedClientFrame);
                }
                Ok(Some(frame))
            }
            Err(FrameError::Incomplete { needed }) => {
                src.reserve(needed);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(frame.payload.len() + 10);
        frame.encode_into(dst);
        Ok(())
    }
}
