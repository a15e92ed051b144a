//! # Relay Gateway
//!
//! A real-time WebSocket messaging gateway. It accepts raw TCP connections,
//! performs the RFC 6455 upgrade itself, and routes JSON notifications to
//! individual users or to project channels.
//!
//! ## Features
//!
//! - **Hand-rolled WebSocket**: opening handshake and frame codec over plain TCP
//! - **User binding**: `auth` binds a connection to a user id (last bind wins)
//! - **Project channels**: `join_project` / `leave_project` subscriptions
//! - **Unicast and broadcast**: `notification` targets a user or a project
//! - **In-process publishing**: the embedding application can push through the `EventBus`
//! - **Task per connection**: one registry lock keeps cleanup atomic
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = Gateway::bind(GatewayConfig::default()).await?;
//!     let bus = gateway.event_bus();
//!
//!     tokio::spawn(gateway.run());
//!
//!     // A change request was approved
//!     bus.publish(
//!         NotificationTarget::Project("P1".to_string()),
//!         serde_json::json!({"title": "CR-12 approved"}),
//!     );
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod protocol;
pub mod server;

/// Re-exports of commonly used types
pub mod prelude {
    // === Config ===
    pub use crate::config::GatewayConfig;

    // === Core ===
    pub use crate::core::{
        error::{EnvelopeError, FrameError, GatewayError, GatewayResult, HandshakeError},
        events::{EventBus, NotificationEvent, NotificationTarget},
    };

    // === Protocol ===
    pub use crate::protocol::{ClientMessage, Frame, Opcode, ServerMessage};

    // === Server ===
    pub use crate::server::{ConnectionId, Gateway, MessageRouter, SessionRegistry};

    // === External dependencies ===
    pub use anyhow::Result;
    pub use serde::{Deserialize, Serialize};
}
