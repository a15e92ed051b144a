//! Listening socket and accept loop
//!
//! The gateway owns the listener, the session registry and the notification
//! bus. Every accepted socket is served by its own task; the registry is the
//! only state those tasks share.
//!
//! # Example
//!
//! ```rust,ignore
//! let gateway = Gateway::bind(GatewayConfig::default()).await?;
//! let bus = gateway.event_bus();
//!
//! tokio::spawn(gateway.run());
//!
//! bus.publish(NotificationTarget::User("42".to_string()), json!({"msg": "hi"}));
//! ```

use super::connection::ConnectionHandler;
use super::registry::SessionRegistry;
use crate::config::GatewayConfig;
use crate::core::error::GatewayResult;
use crate::core::events::{EventBus, NotificationEvent};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Back-off after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// How long connections get to close cleanly before they are aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A bound gateway, ready to serve
pub struct Gateway {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    event_bus: EventBus,
    events: broadcast::Receiver<NotificationEvent>,
    handler: ConnectionHandler,
}

impl Gateway {
    /// Validate the configuration and bind the listening socket
    pub async fn bind(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        let registry = Arc::new(SessionRegistry::new());
        let event_bus = EventBus::new(config.event_bus_capacity);
        // Subscribe now so notifications published before `run` are kept
        let events = event_bus.subscribe();
        let handler = ConnectionHandler::new(registry.clone(), &config);

        Ok(Self {
            listener,
            registry,
            event_bus,
            events,
            handler,
        })
    }

    /// The address actually bound (useful with port 0)
    pub fn local_addr(&self) -> GatewayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the session registry
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Handle for publishing notifications from the embedding application
    pub fn event_bus(&self) -> EventBus {
        self.event_bus.clone()
    }

    /// Serve until the process exits
    pub async fn run(self) -> GatewayResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves
    ///
    /// On shutdown the listener is closed and every connection is sent a 1001
    /// close frame and removed from the registry. Connections still running
    /// after a grace period are aborted.
    pub async fn run_until<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()>,
    {
        let Gateway {
            listener,
            registry,
            event_bus: _event_bus,
            events,
            handler,
        } = self;

        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Gateway listening");

        let dispatch = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run_dispatch_loop(events).await })
        };

        let cancel = CancellationToken::new();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            // Reap finished connection tasks
            while connections.try_join_next().is_some() {}

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(addr = %addr, "Shutdown requested, stopping gateway");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        tracing::debug!(peer = %peer, "Connection accepted");
                        connections.spawn(handler.clone().run(stream, peer, cancel.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        cancel.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                pending = connections.len(),
                "Connections did not close in time, aborting"
            );
            connections.shutdown().await;
        }
        dispatch.abort();

        let remaining = registry.connection_count().await;
        tracing::info!(remaining, "Gateway stopped");

        Ok(())
    }
}
