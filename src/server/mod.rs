//! Server module: accept loop, per-connection tasks, routing and sessions
//!
//! ```text
//! TcpListener ──accept──▶ ConnectionHandler::run()
//!                              │ handshake, then frames
//!                              ▼
//!                        MessageRouter ──▶ SessionRegistry ──▶ outboxes
//! ```

pub mod connection;
pub mod gateway;
pub mod registry;
pub mod router;

pub use connection::ConnectionHandler;
pub use gateway::Gateway;
pub use registry::{ConnectionId, Removed, SessionRegistry};
pub use router::MessageRouter;
