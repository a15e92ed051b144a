//! Session registry for live WebSocket connections
//!
//! The `SessionRegistry` answers "who is connected, authenticated as whom, and
//! subscribed to which project channels". It keeps three views over the same
//! set of connections:
//!
//! - `all`: every live connection, with its outbox and reverse indexes
//! - `by_user`: user id → the single connection bound to it (last bind wins)
//! - `by_project`: project id → the connections that joined that channel
//!
//! All three live behind one `RwLock`, so `unregister` removes a connection
//! from every view in a single step relative to any concurrent lookup, bind or
//! join. Delivery never writes to a socket: it enqueues on the connection's
//! outbox after the lock has been released.
//!
//! # Architecture
//!
//! ```text
//! Router / EventBus ──▶ SessionRegistry::deliver(target)
//!                              │
//!                     read lock: collect outboxes
//!                              │
//!                        release lock
//!                              │
//!                     ──▶ mpsc::send ──▶ connection write task ──▶ socket
//! ```

use crate::core::error::RegistryError;
use crate::core::events::{NotificationEvent, NotificationTarget};
use crate::protocol::envelope::ServerMessage;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

/// Identity of one live connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sender half of a connection's outbox
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// What `unregister` tore down, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removed {
    /// The user binding that pointed at the connection, if any
    pub user_id: Option<String>,
    /// Project channels the connection was removed from
    pub projects: Vec<String>,
}

struct ConnectionEntry {
    tx: Outbox,
    user_id: Option<String>,
    projects: HashSet<String>,
}

#[derive(Default)]
struct Sessions {
    all: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<String, ConnectionId>,
    by_project: HashMap<String, HashSet<ConnectionId>>,
}

impl Sessions {
    fn entry_mut(&mut self, id: &ConnectionId) -> Result<&mut ConnectionEntry, RegistryError> {
        self.all
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.to_string()))
    }

    fn outbox(&self, id: &ConnectionId) -> Option<Outbox> {
        self.all.get(id).map(|entry| entry.tx.clone())
    }
}

/// Process-wide connection state, shared by every connection task
///
/// Owned by the gateway and handed around as `Arc<SessionRegistry>`; tests
/// build their own without any socket.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new connection to `all`
    ///
    /// Returns its id and the receiver the connection's write task drains.
    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        self.sessions.write().await.all.insert(
            id.clone(),
            ConnectionEntry {
                tx,
                user_id: None,
                projects: HashSet::new(),
            },
        );

        tracing::debug!(connection_id = %id, "Connection registered");

        (id, rx)
    }

    /// Remove a connection from every view
    ///
    /// Returns `None` if the connection was not registered.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<Removed> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.all.remove(id)?;

        let mut removed = Removed::default();

        if let Some(user_id) = entry.user_id
            && sessions.by_user.get(&user_id) == Some(id)
        {
            sessions.by_user.remove(&user_id);
            removed.user_id = Some(user_id);
        }

        for project_id in entry.projects {
            if let Some(members) = sessions.by_project.get_mut(&project_id) {
                members.remove(id);
                if members.is_empty() {
                    sessions.by_project.remove(&project_id);
                }
            }
            removed.projects.push(project_id);
        }
        removed.projects.sort();
        drop(sessions);

        tracing::debug!(
            connection_id = %id,
            user_id = ?removed.user_id,
            projects = ?removed.projects,
            "Connection unregistered"
        );

        Some(removed)
    }

    /// Bind a connection to `user_id`
    ///
    /// Last bind wins: a different connection previously bound to the same
    /// user is returned and stays registered, it is just no longer reachable
    /// by user id. A connection re-authenticating as another user drops its
    /// old binding.
    pub async fn bind_user(
        &self,
        id: &ConnectionId,
        user_id: &str,
    ) -> Result<Option<ConnectionId>, RegistryError> {
        let mut sessions = self.sessions.write().await;

        let previous_user = sessions.entry_mut(id)?.user_id.replace(user_id.to_string());
        if let Some(previous_user) = previous_user
            && previous_user != user_id
            && sessions.by_user.get(&previous_user) == Some(id)
        {
            sessions.by_user.remove(&previous_user);
        }

        let displaced = sessions
            .by_user
            .insert(user_id.to_string(), id.clone())
            .filter(|other| other != id);

        if let Some(other) = &displaced
            && let Some(entry) = sessions.all.get_mut(other)
        {
            entry.user_id = None;
        }
        drop(sessions);

        tracing::debug!(
            connection_id = %id,
            user_id = %user_id,
            displaced = ?displaced.as_ref().map(ConnectionId::as_str),
            "User bound"
        );

        Ok(displaced)
    }

    /// Add a connection to a project channel
    ///
    /// Idempotent; returns `true` if the connection was not yet a member.
    pub async fn join_project(
        &self,
        id: &ConnectionId,
        project_id: &str,
    ) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write().await;

        let inserted = sessions.entry_mut(id)?.projects.insert(project_id.to_string());
        sessions
            .by_project
            .entry(project_id.to_string())
            .or_default()
            .insert(id.clone());
        drop(sessions);

        if inserted {
            tracing::debug!(connection_id = %id, project_id = %project_id, "Project joined");
        }

        Ok(inserted)
    }

    /// Remove a connection from a project channel
    ///
    /// Returns `true` if it was a member. Empty channels are dropped.
    pub async fn leave_project(
        &self,
        id: &ConnectionId,
        project_id: &str,
    ) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write().await;

        let removed = sessions.entry_mut(id)?.projects.remove(project_id);
        if let Some(members) = sessions.by_project.get_mut(project_id) {
            members.remove(id);
            if members.is_empty() {
                sessions.by_project.remove(project_id);
            }
        }
        drop(sessions);

        if removed {
            tracing::debug!(connection_id = %id, project_id = %project_id, "Project left");
        }

        Ok(removed)
    }

    /// The connection currently bound to `user_id`
    pub async fn lookup_user(&self, user_id: &str) -> Option<ConnectionId> {
        self.sessions.read().await.by_user.get(user_id).cloned()
    }

    /// Every connection in a project channel (empty for unknown projects)
    pub async fn lookup_project(&self, project_id: &str) -> HashSet<ConnectionId> {
        self.sessions
            .read()
            .await
            .by_project
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The user a connection is bound to, if it is still the current binding
    pub async fn user_of(&self, id: &ConnectionId) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.all.get(id).and_then(|entry| entry.user_id.clone())
    }

    /// Project channels a connection has joined, sorted
    pub async fn projects_of(&self, id: &ConnectionId) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut projects: Vec<String> = sessions
            .all
            .get(id)
            .map(|entry| entry.projects.iter().cloned().collect())
            .unwrap_or_default();
        projects.sort();
        projects
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.read().await.all.contains_key(id)
    }

    /// Get the number of live connections
    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.all.len()
    }

    /// Get the number of user ids with a bound connection
    pub async fn user_count(&self) -> usize {
        self.sessions.read().await.by_user.len()
    }

    /// Get the number of project channels with at least one member
    pub async fn project_count(&self) -> usize {
        self.sessions.read().await.by_project.len()
    }

    /// Queue a message for one connection
    ///
    /// Returns `false` if the connection is gone or its write task has ended.
    pub async fn send_to(&self, id: &ConnectionId, message: ServerMessage) -> bool {
        let outbox = self.sessions.read().await.outbox(id);
        match outbox {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Queue a message for the connection bound to `user_id`
    pub async fn send_to_user(&self, user_id: &str, message: ServerMessage) -> bool {
        let outbox = {
            let sessions = self.sessions.read().await;
            sessions
                .by_user
                .get(user_id)
                .and_then(|id| sessions.outbox(id))
        };

        match outbox {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Queue a message for every member of a project channel
    ///
    /// Returns how many outboxes accepted it.
    pub async fn broadcast_project(&self, project_id: &str, message: ServerMessage) -> usize {
        let outboxes: Vec<(ConnectionId, Outbox)> = {
            let sessions = self.sessions.read().await;
            match sessions.by_project.get(project_id) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| sessions.outbox(id).map(|tx| (id.clone(), tx)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for (id, tx) in outboxes {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(
                    connection_id = %id,
                    "Failed to queue project message (likely disconnected)"
                );
            }
        }
        delivered
    }

    /// Route a notification payload to its target
    ///
    /// Users receive a `notification` envelope, project members a
    /// `project_notification`. Returns the number of connections reached; an
    /// absent target is not an error.
    pub async fn deliver(
        &self,
        target: &NotificationTarget,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> usize {
        let delivered = match target {
            NotificationTarget::User(user_id) => {
                let message = ServerMessage::Notification { data, timestamp };
                usize::from(self.send_to_user(user_id, message).await)
            }
            NotificationTarget::Project(project_id) => {
                let message = ServerMessage::ProjectNotification {
                    project_id: project_id.clone(),
                    data,
                    timestamp,
                };
                self.broadcast_project(project_id, message).await
            }
        };

        tracing::debug!(
            target_type = target.kind(),
            target_id = %target.id(),
            delivered,
            "Notification routed"
        );

        delivered
    }

    /// Run the notification dispatch loop
    ///
    /// Delivers everything published on the `EventBus`. Should be spawned as a
    /// background task; exits when every sender is dropped.
    pub async fn run_dispatch_loop(&self, mut rx: broadcast::Receiver<NotificationEvent>) {
        tracing::info!("Notification dispatch loop started");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    self.deliver(&event.target, event.data, event.timestamp)
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!(
                        count = count,
                        "Notification dispatch loop lagged, {} notifications skipped",
                        count
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("EventBus closed, stopping notification dispatch loop");
                    break;
                }
            }
        }
    }

    /// Check that every id in `by_user` and `by_project` is also in `all`
    #[cfg(test)]
    async fn assert_consistent(&self) {
        let sessions = self.sessions.read().await;
        for (user_id, id) in &sessions.by_user {
            let entry = sessions.all.get(id).expect("by_user entry must be live");
            assert_eq!(entry.user_id.as_deref(), Some(user_id.as_str()));
        }
        for (project_id, members) in &sessions.by_project {
            assert!(!members.is_empty(), "empty bucket for {project_id}");
            for id in members {
                let entry = sessions.all.get(id).expect("by_project member must be live");
                assert!(entry.projects.contains(project_id));
            }
        }
    }
}
