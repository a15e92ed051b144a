//! Core module containing the error types and the notification bus

pub mod error;
pub mod events;

pub use error::{
    ConfigError, EnvelopeError, FrameError, GatewayError, GatewayResult, HandshakeError,
    RegistryError,
};
pub use events::{EventBus, NotificationEvent, NotificationTarget};
