//! Typed topic payloads
//!
//! One bincode schema per topic. Sender identity is never part of a payload;
//! receivers bind it from the link the message arrived on.

use bincode::{Decode, Encode};

/// Visibility scope of an index cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum IndexScope {
    /// Indexes owned by client applications
    Public,
    /// Indexes private to the backend itself
    Internal,
}

/// Payload for `room:created`
#[derive(Debug, Clone, Encode, Decode)]
pub struct RoomCreated {
    /// Room identifier, globally unique
    pub room_id: String,
    /// Storage index the room watches
    pub index: String,
    /// Storage collection the room watches
    pub collection: String,
    /// Serialized realtime filter, opaque to the replication layer
    pub filter: String,
}

/// Payload for `room:removed`
#[derive(Debug, Clone, Encode, Decode)]
pub struct RoomRemoved {
    pub room_id: String,
}

/// Payload for `sub:added` and `sub:removed`
#[derive(Debug, Clone, Encode, Decode)]
pub struct SubscriptionChanged {
    pub room_id: String,
}

/// Payload for `event`
#[derive(Debug, Clone, Encode, Decode)]
pub struct ClusterEventPayload {
    /// Application event name
    pub event: String,
    /// Opaque event body, re-emitted verbatim
    pub payload: Vec<u8>,
}

/// Payload for `notify:document`
#[derive(Debug, Clone, Encode, Decode)]
pub struct DocumentNotificationPayload {
    /// Rooms the notification targets
    pub rooms: Vec<String>,
    /// Opaque serialized notification
    pub notification: Vec<u8>,
}

/// Payload for `notify:user`
#[derive(Debug, Clone, Encode, Decode)]
pub struct UserNotificationPayload {
    /// Room the notification targets
    pub room: String,
    /// Opaque serialized notification
    pub notification: Vec<u8>,
}

/// Payload for `auth:strategy-added`
#[derive(Debug, Clone, Encode, Decode)]
pub struct AuthStrategyAdded {
    /// Plugin that registered the strategy
    pub plugin_name: String,
    /// Strategy name, unique cluster-wide
    pub strategy_name: String,
    /// Serialized strategy definition
    pub definition: String,
}

/// Payload for `auth:strategy-removed`
#[derive(Debug, Clone, Encode, Decode)]
pub struct AuthStrategyRemoved {
    pub plugin_name: String,
    pub strategy_name: String,
}

/// Payload for `index:added`
#[derive(Debug, Clone, Encode, Decode)]
pub struct IndexAdded {
    pub scope: IndexScope,
    pub index: String,
}

/// Payload for `index:removed`
#[derive(Debug, Clone, Encode, Decode)]
pub struct IndexesRemoved {
    pub scope: IndexScope,
    pub indexes: Vec<String>,
}

/// Payload for `collection:added`
#[derive(Debug, Clone, Encode, Decode)]
pub struct CollectionAdded {
    pub scope: IndexScope,
    pub index: String,
    pub collection: String,
}

/// Payload for `collection:removed`
#[derive(Debug, Clone, Encode, Decode)]
pub struct CollectionRemoved {
    pub scope: IndexScope,
    pub index: String,
    pub collection: String,
}

/// Payload for `security:profile-invalidated`
#[derive(Debug, Clone, Encode, Decode)]
pub struct ProfileInvalidated {
    pub profile_id: String,
}

/// Payload for `security:role-invalidated`
#[derive(Debug, Clone, Encode, Decode)]
pub struct RoleInvalidated {
    pub role_id: String,
}

/// Payload for `node:evicted`
#[derive(Debug, Clone, Encode, Decode)]
pub struct NodeEvictedPayload {
    /// Node being evicted, possibly the receiver itself
    pub node_id: String,
    /// Human-readable eviction reason
    pub reason: String,
}

/// Payload for `node:shutdown`
#[derive(Debug, Clone, Encode, Decode)]
pub struct NodeShutdownPayload {
    pub node_id: String,
}

/// One room in a join snapshot
#[derive(Debug, Clone, Encode, Decode)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub index: String,
    pub collection: String,
    pub filter: String,
    /// Subscriber count the sender holds for this room
    pub subscribers: u64,
}

/// One index cache entry in a join snapshot
#[derive(Debug, Clone, Encode, Decode)]
pub struct IndexSnapshot {
    pub scope: IndexScope,
    pub index: String,
    pub collections: Vec<String>,
}

/// Payload for `snapshot`
///
/// The sender's confirmed contribution to the cluster state, pushed once per
/// subscriber connection before any sequenced message. The envelope's
/// `message_id` is the sequence baseline: every sequenced message with a
/// greater id post-dates this snapshot.
#[derive(Debug, Clone, Encode, Decode)]
pub struct NodeSnapshot {
    /// Sender's protocol version, checked before the link goes live
    pub version: u8,
    pub rooms: Vec<RoomSnapshot>,
    pub strategies: Vec<AuthStrategyAdded>,
    pub indexes: Vec<IndexSnapshot>,
}
