//! Wire protocol: opening handshake, frame codec and JSON envelopes
//!
//! Everything here is transport-agnostic and free of shared state, so it can
//! be tested without a socket.

pub mod envelope;
pub mod frame;
pub mod handshake;

pub use envelope::{ClientMessage, ServerMessage};
pub use frame::{Frame, FrameCodec, Opcode, decode_text, encode_text};
pub use handshake::{HandshakeRequest, accept_key};
