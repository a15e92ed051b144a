//! In-process notification publishing
//!
//! The project-management application is the producer of notifications
//! ("a change request was approved"). When it runs in the same process as the
//! gateway it does not need a WebSocket of its own: it publishes on the
//! `EventBus` and the registry's dispatch loop fans the notification out.
//!
//! # Architecture
//!
//! ```text
//! Application ──▶ EventBus::publish() ──▶ broadcast channel ──▶ SessionRegistry::run_dispatch_loop()
//!                                                                    │
//!                                                      user ──▶ `notification`
//!                                                   project ──▶ `project_notification`
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let bus = gateway.event_bus();
//!
//! bus.publish(
//!     NotificationTarget::Project("P1".to_string()),
//!     json!({"title": "Change request approved"}),
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Who a notification is addressed to
///
/// Serialized as `{"target_type": "user", "target_id": "42"}`, the same shape
/// clients use in an inbound `notification` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target_type", content = "target_id", rename_all = "snake_case")]
pub enum NotificationTarget {
    /// The single connection currently bound to this user id
    User(String),
    /// Every connection that joined this project channel
    Project(String),
}

impl NotificationTarget {
    /// Wire name of the target kind (`user` or `project`)
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationTarget::User(_) => "user",
            NotificationTarget::Project(_) => "project",
        }
    }

    /// The addressed identifier
    pub fn id(&self) -> &str {
        match self {
            NotificationTarget::User(id) | NotificationTarget::Project(id) => id,
        }
    }
}

/// A published notification with its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Unique event ID
    pub id: Uuid,
    /// When the notification was published
    pub timestamp: DateTime<Utc>,
    /// Delivery target
    #[serde(flatten)]
    pub target: NotificationTarget,
    /// Application payload, forwarded untouched
    pub data: serde_json::Value,
}

impl NotificationEvent {
    /// Create a new notification event
    pub fn new(target: NotificationTarget, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            target,
            data,
        }
    }
}

/// Broadcast-based bus for notifications published by the embedding application
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NotificationEvent>,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    ///
    /// The capacity determines how many notifications can be buffered before
    /// a slow dispatch loop starts skipping them (lagged).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notification
    ///
    /// Fire-and-forget: if nothing is listening the notification is dropped.
    /// Returns the number of receivers that will see it.
    pub fn publish(&self, target: NotificationTarget, data: serde_json::Value) -> usize {
        self.publish_event(NotificationEvent::new(target, data))
    }

    /// Publish an already built event
    pub fn publish_event(&self, event: NotificationEvent) -> usize {
        // send() returns Err only if there are no receivers
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to notifications published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_serialization() {
        let target = NotificationTarget::User("42".to_string());
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json, json!({"target_type": "user", "target_id": "42"}));

        let target: NotificationTarget =
            serde_json::from_value(json!({"target_type": "project", "target_id": "P1"})).unwrap();
        assert_eq!(target, NotificationTarget::Project("P1".to_string()));
        assert_eq!(target.kind(), "project");
        assert_eq!(target.id(), "P1");
    }

    #[test]
    fn test_event_flattens_target() {
        let event = NotificationEvent::new(
            NotificationTarget::Project("P1".to_string()),
            json!({"title": "approved"}),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["target_type"], "project");
        assert_eq!(json["target_id"], "P1");
        assert_eq!(json["data"]["title"], "approved");
        assert!(!event.id.is_nil());
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.publish(NotificationTarget::User("7".to_string()), json!({"n": 1}));
        assert_eq!(receivers, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.target, NotificationTarget::User("7".to_string()));
        assert_eq!(received.data["n"], 1);
    }

    #[test]
    fn test_event_bus_publish_without_subscribers() {
        let bus = EventBus::new(16);
        let receivers = bus.publish(NotificationTarget::User("7".to_string()), json!({}));
        assert_eq!(receivers, 0);
    }

    #[test]
    fn test_event_bus_clone_shares_channel() {
        let bus = EventBus::default();
        let _rx = bus.subscribe();

        let bus2 = bus.clone();
        assert_eq!(bus2.receiver_count(), 1);
    }
}
