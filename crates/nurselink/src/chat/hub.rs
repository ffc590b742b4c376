//! Chat hub: presence registry and message dispatcher.
//!
//! One dispatch task owns the `user_id -> connection` map. Every register,
//! unregister, broadcast and direct send is a command on a bounded channel
//! consumed by that task, so the map is never shared. The hub holds the only
//! sender of each connection's outbound queue: dropping a registry entry is
//! what closes the queue, which makes a double close unrepresentable.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::types::{Identity, PresenceEntry, WireMessage};

/// Default capacity of the hub command channel.
pub const DEFAULT_HUB_BUFFER: usize = 1024;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Serialized message shared by every fan-out target.
pub type Outbound = Arc<str>;

/// Process-unique connection id.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Serialize a message once for fan-out.
pub fn encode(message: &WireMessage) -> Result<Outbound, serde_json::Error> {
    serde_json::to_string(message).map(Outbound::from)
}

/// Hub errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The dispatch loop has stopped.
    #[error("chat hub is not running")]
    Closed,
}

/// Why a non-blocking enqueue failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

/// The hub's side of a live connection.
///
/// Not `Clone`: the registry entry is the single owner of the queue sender.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its bounded outbound queue.
    pub fn channel(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            connected_at: Utc::now(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Append to the outbound queue without waiting.
    pub fn try_enqueue(&self, message: Outbound) -> Result<(), EnqueueError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            user_id: self.identity.user_id.clone(),
            name: self.identity.name.clone(),
            role: self.identity.role,
            connected_at: self.connected_at,
        }
    }
}

enum HubCommand {
    Register(ConnectionHandle),
    Unregister {
        user_id: String,
        connection_id: ConnectionId,
    },
    Broadcast(Outbound),
    SendTo {
        user_id: String,
        message: Outbound,
        reply: oneshot::Sender<bool>,
    },
    Online {
        reply: oneshot::Sender<Vec<PresenceEntry>>,
    },
}

/// Cloneable handle to the hub's dispatch loop.
#[derive(Clone)]
pub struct ChatHub {
    tx: mpsc::Sender<HubCommand>,
}

impl ChatHub {
    /// Create a hub handle and the dispatcher that must be run for it.
    pub fn new(buffer: usize) -> (Self, HubDispatcher) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let dispatcher = HubDispatcher {
            rx,
            registry: HashMap::new(),
        };
        (Self { tx }, dispatcher)
    }

    /// Create a hub and spawn its dispatch loop on the current runtime.
    pub fn spawn(buffer: usize) -> Self {
        let (hub, dispatcher) = Self::new(buffer);
        tokio::spawn(dispatcher.run());
        hub
    }

    async fn command(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).await.map_err(|_| HubError::Closed)
    }

    /// Register a connection, replacing any previous one for the same user.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.command(HubCommand::Register(handle)).await
    }

    /// Unregister a connection if it is still the current one for `user_id`.
    pub async fn unregister(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Result<(), HubError> {
        self.command(HubCommand::Unregister {
            user_id: user_id.to_string(),
            connection_id,
        })
        .await
    }

    /// Deliver to every registered connection.
    pub async fn broadcast(&self, message: Outbound) -> Result<(), HubError> {
        self.command(HubCommand::Broadcast(message)).await
    }

    /// Deliver to one user. Returns whether the message was handed off.
    pub async fn send_to(&self, user_id: &str, message: Outbound) -> Result<bool, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::SendTo {
            user_id: user_id.to_string(),
            message,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Snapshot of connected users, sorted by user id.
    pub async fn online(&self) -> Result<Vec<PresenceEntry>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::Online { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn is_online(&self, user_id: &str) -> Result<bool, HubError> {
        Ok(self.online().await?.iter().any(|p| p.user_id == user_id))
    }
}

/// Owner of the registry. Runs until every [`ChatHub`] handle is dropped.
pub struct HubDispatcher {
    rx: mpsc::Receiver<HubCommand>,
    registry: HashMap<String, ConnectionHandle>,
}

impl HubDispatcher {
    /// The dispatch loop.
    pub async fn run(mut self) {
        info!("Chat hub started");
        while let Some(cmd) = self.rx.recv().await {
            self.apply(cmd);
        }
        info!(
            "Chat hub stopped, closing {} connection(s)",
            self.registry.len()
        );
    }

    fn apply(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(handle) => self.register(handle),
            HubCommand::Unregister {
                user_id,
                connection_id,
            } => self.unregister(&user_id, connection_id),
            HubCommand::Broadcast(message) => self.broadcast(&message),
            HubCommand::SendTo {
                user_id,
                message,
                reply,
            } => {
                let delivered = self.send_to(&user_id, message);
                // The caller may have given up waiting.
                let _ = reply.send(delivered);
            }
            HubCommand::Online { reply } => {
                let mut online: Vec<_> = self.registry.values().map(|c| c.presence()).collect();
                online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                let _ = reply.send(online);
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let user_id = handle.identity.user_id.clone();
        let connection_id = handle.id;
        if let Some(previous) = self.registry.insert(user_id.clone(), handle) {
            info!(
                "Connection {} for user {} superseded by connection {}",
                previous.id, user_id, connection_id
            );
            // Dropping `previous` closes its queue.
        }
        info!(
            "Registered chat connection {} for user {} ({} online)",
            connection_id,
            user_id,
            self.registry.len()
        );
    }

    fn unregister(&mut self, user_id: &str, connection_id: ConnectionId) {
        match self.registry.get(user_id) {
            Some(current) if current.id == connection_id => {
                self.registry.remove(user_id);
                info!(
                    "Unregistered chat connection {} for user {} ({} online)",
                    connection_id,
                    user_id,
                    self.registry.len()
                );
            }
            _ => debug!(
                "Ignoring stale unregister of connection {} for user {}",
                connection_id, user_id
            ),
        }
    }

    fn broadcast(&mut self, message: &Outbound) {
        let dead: Vec<String> = self
            .registry
            .iter()
            .filter_map(|(user_id, conn)| match conn.try_enqueue(message.clone()) {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        "Broadcast to user {} connection {} failed: {}",
                        user_id, conn.id, e
                    );
                    Some(user_id.clone())
                }
            })
            .collect();

        for user_id in dead {
            self.evict(&user_id);
        }
    }

    fn send_to(&mut self, user_id: &str, message: Outbound) -> bool {
        let Some(conn) = self.registry.get(user_id) else {
            debug!("Direct message to offline user {}", user_id);
            return false;
        };

        match conn.try_enqueue(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Direct message to user {} connection {} failed: {}",
                    user_id, conn.id, e
                );
                self.evict(user_id);
                false
            }
        }
    }

    fn evict(&mut self, user_id: &str) {
        if let Some(conn) = self.registry.remove(user_id) {
            warn!(
                "Evicted chat connection {} for user {} ({} online)",
                conn.id,
                user_id,
                self.registry.len()
            );
        }
    }
}
