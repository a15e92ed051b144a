//! Application envelope definitions
//!
//! Envelopes are the JSON documents carried in text frames. The `type` field
//! selects the variant.
//!
//! ## Client → Server Messages
//!
//! ```json
//! {"type": "auth", "user_id": "42", "token": "..."}
//! {"type": "join_project", "project_id": "P1"}
//! {"type": "leave_project", "project_id": "P1"}
//! {"type": "notification", "target_type": "user", "target_id": "42", "notification": {...}}
//! {"type": "ping"}
//! ```
//!
//! ## Server → Client Messages
//!
//! ```json
//! {"type": "connection", "connection_id": "conn_...", "message": "...", "timestamp": "..."}
//! {"type": "auth_success", "user_id": "42"}
//! {"type": "auth_error", "message": "..."}
//! {"type": "project_joined", "project_id": "P1"}
//! {"type": "project_left", "project_id": "P1"}
//! {"type": "notification", "data": {...}, "timestamp": "..."}
//! {"type": "project_notification", "project_id": "P1", "data": {...}, "timestamp": "..."}
//! {"type": "notification_sent", "target_type": "user", "target_id": "42", "timestamp": "..."}
//! {"type": "pong", "timestamp": "..."}
//! {"type": "error", "message": "..."}
//! ```
//!
//! Identifier fields accept JSON strings or integers; both are normalized to
//! strings so `42` and `"42"` address the same user.

use crate::core::error::EnvelopeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a user identity
    Auth {
        #[serde(default, deserialize_with = "lenient_identifier")]
        user_id: Option<String>,
        #[serde(default, deserialize_with = "credential")]
        token: Option<String>,
    },
    /// Subscribe to a project channel
    JoinProject {
        #[serde(default, deserialize_with = "identifier")]
        project_id: Option<String>,
    },
    /// Unsubscribe from a project channel
    LeaveProject {
        #[serde(default, deserialize_with = "identifier")]
        project_id: Option<String>,
    },
    /// Deliver a payload to a user or a project channel
    Notification {
        #[serde(default)]
        target_type: Option<String>,
        #[serde(default, deserialize_with = "identifier")]
        target_id: Option<String>,
        #[serde(default)]
        notification: Option<Value>,
    },
    /// Keepalive ping
    Ping,
    /// Any `type` this gateway does not handle
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a text payload into an envelope
    ///
    /// Unknown types are reported with their name so the client can tell a
    /// typo from malformed JSON.
    pub fn parse(text: &str) -> Result<ClientMessage, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Invalid(e.to_string()))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(EnvelopeError::Invalid("'type' must be a string".to_string())),
            None => return Err(EnvelopeError::MissingField("type")),
        };

        match ClientMessage::deserialize(value) {
            Ok(ClientMessage::Unknown) => Err(EnvelopeError::UnknownType(kind)),
            Ok(msg) => Ok(msg),
            Err(e) => Err(EnvelopeError::Invalid(e.to_string())),
        }
    }
}

/// Accept `"42"` or `42`; treat `null` and `""` as absent
fn identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or integer identifier, got {other}"
        ))),
    }
}

/// Like [`identifier`], but unusable values count as absent
///
/// Lets `auth` answer a bad `user_id` with `auth_error` rather than a parse
/// error.
fn lenient_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Any present value except `null` and `""`; the token is not inspected
fn credential<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent right after the handshake
    Connection {
        connection_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The connection is now bound to `user_id`
    AuthSuccess { user_id: String },
    /// `auth` was missing `user_id` or `token`
    AuthError { message: String },
    /// Subscription to a project channel confirmed
    ProjectJoined { project_id: String },
    /// Subscription to a project channel removed
    ProjectLeft { project_id: String },
    /// A notification addressed to this connection's user
    Notification {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    /// A notification broadcast to a project channel
    ProjectNotification {
        project_id: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    /// Acknowledges a `notification` request; does not confirm delivery
    NotificationSent {
        target_type: String,
        target_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Keepalive response
    Pong { timestamp: DateTime<Utc> },
    /// Error message
    Error { message: String },
}

impl ServerMessage {
    pub fn welcome(connection_id: impl Into<String>) -> Self {
        ServerMessage::Connection {
            connection_id: connection_id.into(),
            message: "Connected to notification gateway".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Wire name of this message's `type`
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::AuthSuccess { .. } => "auth_success",
            ServerMessage::AuthError { .. } => "auth_error",
            ServerMessage::ProjectJoined { .. } => "project_joined",
            ServerMessage::ProjectLeft { .. } => "project_left",
            ServerMessage::Notification { .. } => "notification",
            ServerMessage::ProjectNotification { .. } => "project_notification",
            ServerMessage::NotificationSent { .. } => "notification_sent",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}
