//! Message router for inbound envelopes
//!
//! Each text payload is handled on its own: parse, act on the registry, and
//! answer the sender. Application errors never close the connection; they come
//! back as `error` (or `auth_error`) envelopes.

use super::registry::{ConnectionId, SessionRegistry};
use crate::core::error::EnvelopeError;
use crate::core::events::NotificationTarget;
use crate::protocol::envelope::{ClientMessage, ServerMessage};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Dispatches decoded text payloads to their handlers
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one payload and queue the reply on the sender's outbox
    pub async fn handle(&self, connection_id: &ConnectionId, text: &str) {
        let reply = self.route(connection_id, text).await;
        if !self.registry.send_to(connection_id, reply).await {
            tracing::debug!(connection_id = %connection_id, "Reply dropped, connection gone");
        }
    }

    /// Handle one payload and return the reply for the sender
    ///
    /// Deliveries to other connections happen as a side effect.
    pub async fn route(&self, connection_id: &ConnectionId, text: &str) -> ServerMessage {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Rejected envelope");
                return ServerMessage::error(e.to_string());
            }
        };

        match msg {
            ClientMessage::Auth { user_id, token } => self.auth(connection_id, user_id, token).await,
            ClientMessage::JoinProject { project_id } => {
                self.join_project(connection_id, project_id).await
            }
            ClientMessage::LeaveProject { project_id } => {
                self.leave_project(connection_id, project_id).await
            }
            ClientMessage::Notification {
                target_type,
                target_id,
                notification,
            } => {
                self.notification(connection_id, target_type, target_id, notification)
                    .await
            }
            ClientMessage::Ping => ServerMessage::pong(),
            // parse() already turns unknown types into an error
            ClientMessage::Unknown => ServerMessage::error("Unknown message type"),
        }
    }

    async fn auth(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<String>,
        token: Option<String>,
    ) -> ServerMessage {
        // The token is not verified; identity is asserted by the caller
        let (Some(user_id), Some(_)) = (user_id, token) else {
            return ServerMessage::AuthError {
                message: "user_id and token are required".to_string(),
            };
        };

        match self.registry.bind_user(connection_id, &user_id).await {
            Ok(displaced) => {
                if let Some(previous) = displaced {
                    tracing::info!(
                        connection_id = %connection_id,
                        previous_connection_id = %previous,
                        user_id = %user_id,
                        "User re-authenticated on a new connection"
                    );
                }
                ServerMessage::AuthSuccess { user_id }
            }
            Err(e) => ServerMessage::error(e.to_string()),
        }
    }

    async fn join_project(
        &self,
        connection_id: &ConnectionId,
        project_id: Option<String>,
    ) -> ServerMessage {
        let Some(project_id) = project_id else {
            return ServerMessage::error(EnvelopeError::MissingField("project_id").to_string());
        };

        match self.registry.join_project(connection_id, &project_id).await {
            Ok(_) => ServerMessage::ProjectJoined { project_id },
            Err(e) => ServerMessage::error(e.to_string()),
        }
    }

    async fn leave_project(
        &self,
        connection_id: &ConnectionId,
        project_id: Option<String>,
    ) -> ServerMessage {
        let Some(project_id) = project_id else {
            return ServerMessage::error(EnvelopeError::MissingField("project_id").to_string());
        };

        match self.registry.leave_project(connection_id, &project_id).await {
            Ok(_) => ServerMessage::ProjectLeft { project_id },
            Err(e) => ServerMessage::error(e.to_string()),
        }
    }

    async fn notification(
        &self,
        connection_id: &ConnectionId,
        target_type: Option<String>,
        target_id: Option<String>,
        notification: Option<Value>,
    ) -> ServerMessage {
        let target = match resolve_target(target_type, target_id) {
            Ok(target) => target,
            Err(e) => return ServerMessage::error(e.to_string()),
        };
        let Some(data) = notification else {
            return ServerMessage::error(EnvelopeError::MissingField("notification").to_string());
        };

        let timestamp = Utc::now();
        let delivered = self.registry.deliver(&target, data, timestamp).await;

        tracing::debug!(
            connection_id = %connection_id,
            target_type = target.kind(),
            target_id = %target.id(),
            delivered,
            "Notification request handled"
        );

        // Acknowledged whether or not anyone received it
        ServerMessage::NotificationSent {
            target_type: target.kind().to_string(),
            target_id: target.id().to_string(),
            timestamp,
        }
    }
}

fn resolve_target(
    target_type: Option<String>,
    target_id: Option<String>,
) -> Result<NotificationTarget, EnvelopeError> {
    let target_type = target_type.ok_or(EnvelopeError::MissingField("target_type"))?;
    let target_id = target_id.ok_or(EnvelopeError::MissingField("target_id"))?;

    match target_type.as_str() {
        "user" => Ok(NotificationTarget::User(target_id)),
        "project" => Ok(NotificationTarget::Project(target_id)),
        _ => Err(EnvelopeError::InvalidTarget(target_type)),
    }
}
