//! Local Delivery Bus
//!
//! Replication handlers re-deliver cluster traffic to in-process consumers
//! (the realtime engine, the security layer, plugins) through these typed
//! broadcast channels. A send with no subscribers is not an error; delivery
//! is strictly best-effort fan-out.

use bytes::Bytes;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// An application event re-emitted by a remote node
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    /// Node the event originated from
    pub origin: String,
    /// Application event name
    pub event: String,
    /// Opaque event body
    pub payload: Bytes,
}

/// A notification re-delivered from a remote node
#[derive(Debug, Clone)]
pub enum Notification {
    /// Document change notification targeting one or more rooms
    Document {
        origin: String,
        rooms: Vec<String>,
        payload: Bytes,
    },
    /// User join/leave notification targeting one room
    User {
        origin: String,
        room: String,
        payload: Bytes,
    },
}

/// A security cache invalidation signal
#[derive(Debug, Clone)]
pub enum SecuritySignal {
    ProfileInvalidated { profile_id: String },
    RoleInvalidated { role_id: String },
    ValidatorsRefreshed,
}

/// Broadcast channels carrying replicated traffic to local consumers
#[derive(Clone)]
pub struct NodeEvents {
    cluster: broadcast::Sender<RemoteEvent>,
    notifications: broadcast::Sender<Notification>,
    security: broadcast::Sender<SecuritySignal>,
}

impl NodeEvents {
    pub fn new() -> Self {
        let (cluster, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (notifications, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (security, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            cluster,
            notifications,
            security,
        }
    }

    /// Subscribe to re-emitted application events
    pub fn subscribe_cluster(&self) -> broadcast::Receiver<RemoteEvent> {
        self.cluster.subscribe()
    }

    /// Subscribe to re-delivered document/user notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Subscribe to security cache invalidation signals
    pub fn subscribe_security(&self) -> broadcast::Receiver<SecuritySignal> {
        self.security.subscribe()
    }

    pub(crate) fn emit_cluster(&self, event: RemoteEvent) {
        let _ = self.cluster.send(event);
    }

    pub(crate) fn emit_notification(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    pub(crate) fn emit_security(&self, signal: SecuritySignal) {
        let _ = self.security.send(signal);
    }
}

impl Default for NodeEvents {
    fn default() -> Self {
        Self::new()
    }
}
