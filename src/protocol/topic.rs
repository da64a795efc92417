//! Wire topic names
//!
//! One constant per replicated topic. The names are part of the wire
//! contract; renaming one is a protocol break.

/// Proof-of-life traffic, no state mutation
pub const HEARTBEAT: &str = "heartbeat";
/// Join baseline pushed to a newly accepted subscriber
pub const SNAPSHOT: &str = "snapshot";
/// A realtime room was registered on the sender
pub const ROOM_CREATED: &str = "room:created";
/// The sender dropped its interest in a realtime room
pub const ROOM_REMOVED: &str = "room:removed";
/// One more subscriber on the sender for a room
pub const SUBSCRIPTION_ADDED: &str = "sub:added";
/// One fewer subscriber on the sender for a room
pub const SUBSCRIPTION_REMOVED: &str = "sub:removed";
/// Opaque application event re-emitted cluster-wide
pub const CLUSTER_EVENT: &str = "event";
/// Document notification re-delivered to local room subscribers
pub const DOCUMENT_NOTIFICATION: &str = "notify:document";
/// User notification re-delivered to a local room
pub const USER_NOTIFICATION: &str = "notify:user";
/// An authentication strategy was registered
pub const AUTH_STRATEGY_ADDED: &str = "auth:strategy-added";
/// An authentication strategy was removed
pub const AUTH_STRATEGY_REMOVED: &str = "auth:strategy-removed";
/// Storage index now known to exist
pub const INDEX_ADDED: &str = "index:added";
/// Storage indexes were deleted
pub const INDEXES_REMOVED: &str = "index:removed";
/// Storage collection now known to exist
pub const COLLECTION_ADDED: &str = "collection:added";
/// Storage collection was deleted
pub const COLLECTION_REMOVED: &str = "collection:removed";
/// Security profile cache invalidation
pub const PROFILE_INVALIDATED: &str = "security:profile-invalidated";
/// Security role cache invalidation
pub const ROLE_INVALIDATED: &str = "security:role-invalidated";
/// Document validators must be reloaded
pub const VALIDATORS_REFRESHED: &str = "security:validators-refreshed";
/// A node was evicted from the cluster
pub const NODE_EVICTED: &str = "node:evicted";
/// A node is leaving the cluster gracefully
pub const NODE_SHUTDOWN: &str = "node:shutdown";
