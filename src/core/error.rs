//! Typed error handling for the gateway
//!
//! Errors are split by the layer that produces them so callers can decide the
//! policy per category:
//!
//! - [`FrameError`]: malformed or unsupported WebSocket frames (protocol errors)
//! - [`HandshakeError`]: the HTTP upgrade request could not be honoured
//! - [`EnvelopeError`]: an inbound JSON envelope the router cannot act on
//! - [`RegistryError`]: a registry call named a connection that is gone
//! - [`ConfigError`]: invalid gateway configuration
//! - [`GatewayError`]: the umbrella type returned by the server layer
//!
//! Transport and protocol errors are fatal to the connection that raised them.
//! Application errors (bad JSON, unknown message type, missing fields) never
//! surface here: the router answers them with an `error` envelope instead.

use thiserror::Error;

/// The main error type for the gateway server layer
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Socket level failure (accept, read, write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a frame we cannot decode or do not support
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The opening handshake failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Configuration rejected at startup
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Short machine-readable code, used as a structured log field
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Io(_) => "TRANSPORT_ERROR",
            GatewayError::Frame(e) => e.error_code(),
            GatewayError::Handshake(_) => "HANDSHAKE_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the error was caused by the peer violating the protocol
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, GatewayError::Frame(_) | GatewayError::Handshake(_))
    }
}

// =============================================================================
// Frame Errors
// =============================================================================

/// Errors raised while decoding a WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer ends before the frame does
    #[error("Truncated frame: {needed} more byte(s) required")]
    Incomplete { needed: usize },

    /// Opcode outside the RFC 6455 set
    #[error("Unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// Any of the RSV1-3 bits was set without a negotiated extension
    #[error("Reserved bits set in frame header")]
    ReservedBits,

    /// Client-to-server frames must carry a mask key
    #[error("Client frame is not masked")]
    UnmaskedClientFrame,

    /// Declared payload length exceeds the configured limit
    #[error("Payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: usize },

    /// Text payload is not valid UTF-8
    #[error("Text payload is not valid UTF-8")]
    InvalidUtf8,

    /// Fragmented messages are not supported
    #[error("Fragmented frames are not supported")]
    Fragmented,

    /// Control frames must be final and carry at most 125 payload bytes
    #[error("Control frame is fragmented or longer than 125 bytes ({size} bytes)")]
    InvalidControlFrame { size: u64 },

    /// Underlying stream failure surfaced through the codec
    #[error("I/O error while framing: {0}")]
    Io(String),
}

impl FrameError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            FrameError::Incomplete { .. } => "FRAME_TRUNCATED",
            FrameError::UnknownOpcode(_) => "FRAME_UNKNOWN_OPCODE",
            FrameError::ReservedBits => "FRAME_RESERVED_BITS",
            FrameError::UnmaskedClientFrame => "FRAME_UNMASKED",
            FrameError::PayloadTooLarge { .. } => "FRAME_TOO_LARGE",
            FrameError::InvalidUtf8 => "FRAME_INVALID_UTF8",
            FrameError::Fragmented => "FRAME_FRAGMENTED",
            FrameError::InvalidControlFrame { .. } => "FRAME_INVALID_CONTROL",
            FrameError::Io(_) => "TRANSPORT_ERROR",
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err.to_string())
    }
}

// =============================================================================
// Handshake Errors
// =============================================================================

/// Errors raised while negotiating the WebSocket upgrade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The request line is not `GET <path> HTTP/1.1`
    #[error("Malformed upgrade request: {0}")]
    MalformedRequest(String),

    /// The `Sec-WebSocket-Key` header is absent or empty
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// The request headers did not fit in the handshake buffer
    #[error("Upgrade request exceeds {max} bytes")]
    TooLarge { max: usize },

    /// The peer did not finish the request within the handshake timeout
    #[error("Timed out waiting for upgrade request")]
    Timeout,

    /// The peer closed the socket before completing the request
    #[error("Connection closed during handshake")]
    ConnectionClosed,
}

// =============================================================================
// Envelope Errors
// =============================================================================

/// Application-level errors in an inbound envelope
///
/// These are answered with an `error` envelope; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The payload is not JSON or does not fit the envelope shape
    #[error("Invalid message: {0}")]
    Invalid(String),

    /// The `type` field names no known handler
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A handler-specific field is absent or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// `target_type` is neither `user` nor `project`
    #[error("Invalid target_type: {0}")]
    InvalidTarget(String),
}

// =============================================================================
// Registry Errors
// =============================================================================

/// Errors raised by the session registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection was never registered or has already been removed
    #[error("Connection {0} not found")]
    UnknownConnection(String),
}

// =============================================================================
// Config Errors
// =============================================================================

/// Errors related to gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric setting must be strictly positive
    #[error("Configuration value '{field}' must be greater than zero")]
    MustBePositive { field: &'static str },

    /// The host string is empty
    #[error("Configuration value 'host' must not be empty")]
    EmptyHost,
}

/// Result alias used throughout the server layer
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
