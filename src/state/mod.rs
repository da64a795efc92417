//! Full State
//!
//! The locally-held replica of cluster-wide metadata: realtime rooms with
//! their per-node subscriber counts, authentication strategies, and the
//! index/collection existence cache.
//!
//! Every mutating call is keyed by the node the change originates from; a
//! link only ever writes entries for its own remote peer, and the local
//! mutation API only writes entries for the local node. Entries are sharded
//! per key, so concurrent updates about different rooms never contend.

use std::collections::{HashMap, HashSet};
use std::fmt;

use dashmap::DashMap;

use crate::protocol::{
    AuthStrategyAdded, IndexScope, IndexSnapshot, NodeSnapshot, RoomCreated, RoomSnapshot,
    SYNC_PROTOCOL_VERSION,
};

/// Full state error types
///
/// A replication handler returning one of these means the local replica can
/// no longer be trusted; the caller is expected to self-evict, not retry.
#[derive(Debug)]
pub enum StateError {
    /// A subscription change referenced a room this replica never saw
    UnknownRoom(String),
    /// A subscription change referenced a node with no stake in the room
    UnknownRoomOwner(String, String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::UnknownRoom(room_id) => {
                write!(f, "unknown realtime room \"{}\"", room_id)
            }
            StateError::UnknownRoomOwner(room_id, node_id) => {
                write!(f, "node \"{}\" holds no stake in room \"{}\"", node_id, room_id)
            }
        }
    }
}

impl std::error::Error for StateError {}

/// One node's stake in a realtime room
#[derive(Debug, Clone)]
pub struct RoomOwner {
    /// Last sync message id applied for this (room, node) pair
    pub message_id: u64,
    /// Subscribers the node holds on the room
    pub subscribers: u64,
}

/// A realtime room known to the cluster
#[derive(Debug, Clone)]
pub struct RealtimeRoom {
    pub index: String,
    pub collection: String,
    /// Serialized realtime filter, opaque here
    pub filter: String,
    /// Per-node stakes, keyed by node id
    pub owners: HashMap<String, RoomOwner>,
}

/// A registered authentication strategy
#[derive(Debug, Clone)]
pub struct AuthStrategyEntry {
    pub plugin_name: String,
    pub strategy_name: String,
    /// Serialized strategy definition
    pub definition: String,
}

/// Known collections of one storage index
#[derive(Debug, Clone, Default)]
pub struct IndexCacheEntry {
    pub collections: HashSet<String>,
}

/// The cluster-wide state replica
#[derive(Default)]
pub struct FullState {
    /// Realtime rooms keyed by room id
    rooms: DashMap<String, RealtimeRoom>,
    /// Authentication strategies keyed by strategy name
    strategies: DashMap<String, AuthStrategyEntry>,
    /// Index cache keyed by (scope, index name)
    indexes: DashMap<(IndexScope, String), IndexCacheEntry>,
}

impl FullState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room on behalf of `node_id`, with no subscribers yet
    ///
    /// Re-announcing an existing room refreshes the node's stake; counts are
    /// never reset by a re-announcement.
    pub fn add_room(&self, node_id: &str, message_id: u64, room: &RoomCreated) {
        let mut entry = self
            .rooms
            .entry(room.room_id.clone())
            .or_insert_with(|| RealtimeRoom {
                index: room.index.clone(),
                collection: room.collection.clone(),
                filter: room.filter.clone(),
                owners: HashMap::new(),
            });

        entry
            .owners
            .entry(node_id.to_string())
            .and_modify(|owner| owner.message_id = message_id)
            .or_insert(RoomOwner {
                message_id,
                subscribers: 0,
            });
    }

    /// Drop `node_id`'s stake in a room, removing the room once unowned
    ///
    /// Removing an unknown room is a no-op: another peer may have already
    /// converged on the same removal.
    pub fn remove_room(&self, node_id: &str, room_id: &str) {
        let remove = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                room.owners.remove(node_id);
                room.owners.is_empty()
            }
            None => false,
        };

        if remove {
            self.rooms.remove(room_id);
        }
    }

    /// Count one more subscriber for `node_id` on a room
    pub fn add_subscription(
        &self,
        node_id: &str,
        message_id: u64,
        room_id: &str,
    ) -> Result<(), StateError> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StateError::UnknownRoom(room_id.to_string()))?;

        let owner = room
            .owners
            .entry(node_id.to_string())
            .or_insert(RoomOwner {
                message_id,
                subscribers: 0,
            });
        owner.message_id = message_id;
        owner.subscribers += 1;

        Ok(())
    }

    /// Count one fewer subscriber for `node_id` on a room
    pub fn remove_subscription(
        &self,
        node_id: &str,
        message_id: u64,
        room_id: &str,
    ) -> Result<(), StateError> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StateError::UnknownRoom(room_id.to_string()))?;

        let owner = room.owners.get_mut(node_id).ok_or_else(|| {
            StateError::UnknownRoomOwner(room_id.to_string(), node_id.to_string())
        })?;
        owner.message_id = message_id;
        owner.subscribers = owner.subscribers.saturating_sub(1);

        Ok(())
    }

    /// Total subscribers on a room, summed across owning nodes
    pub fn subscriber_count(&self, room_id: &str) -> u64 {
        self.rooms
            .get(room_id)
            .map(|room| room.owners.values().map(|o| o.subscribers).sum())
            .unwrap_or(0)
    }

    /// Number of rooms currently known
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Snapshot one room, if known
    pub fn room(&self, room_id: &str) -> Option<RealtimeRoom> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Register or replace an authentication strategy
    pub fn add_strategy(&self, entry: AuthStrategyEntry) {
        self.strategies.insert(entry.strategy_name.clone(), entry);
    }

    /// Remove an authentication strategy; unknown names are a no-op
    pub fn remove_strategy(&self, strategy_name: &str) {
        self.strategies.remove(strategy_name);
    }

    /// Look up an authentication strategy
    pub fn strategy(&self, strategy_name: &str) -> Option<AuthStrategyEntry> {
        self.strategies.get(strategy_name).map(|s| s.clone())
    }

    /// Mark an index as existing
    pub fn add_index(&self, scope: IndexScope, index: &str) {
        self.indexes
            .entry((scope, index.to_string()))
            .or_default();
    }

    /// Drop indexes from the cache
    pub fn remove_indexes(&self, scope: IndexScope, indexes: &[String]) {
        for index in indexes {
            self.indexes.remove(&(scope, index.clone()));
        }
    }

    /// Mark a collection as existing, creating its index entry if needed
    pub fn add_collection(&self, scope: IndexScope, index: &str, collection: &str) {
        self.indexes
            .entry((scope, index.to_string()))
            .or_default()
            .collections
            .insert(collection.to_string());
    }

    /// Drop a collection from the cache
    pub fn remove_collection(&self, scope: IndexScope, index: &str, collection: &str) {
        if let Some(mut entry) = self.indexes.get_mut(&(scope, index.to_string())) {
            entry.collections.remove(collection);
        }
    }

    /// Whether an index is known to exist
    pub fn has_index(&self, scope: IndexScope, index: &str) -> bool {
        self.indexes.contains_key(&(scope, index.to_string()))
    }

    /// Whether a collection is known to exist
    pub fn has_collection(&self, scope: IndexScope, index: &str, collection: &str) -> bool {
        self.indexes
            .get(&(scope, index.to_string()))
            .map(|entry| entry.collections.contains(collection))
            .unwrap_or(false)
    }

    /// Remove everything contributed by one node
    ///
    /// Called on eviction and on graceful peer departure. Strategies and the
    /// index cache are cluster-global facts and survive the node that
    /// announced them.
    pub fn remove_node(&self, node_id: &str) -> usize {
        let mut touched = 0;
        let mut emptied = Vec::new();

        for mut room in self.rooms.iter_mut() {
            if room.owners.remove(node_id).is_some() {
                touched += 1;
                if room.owners.is_empty() {
                    emptied.push(room.key().clone());
                }
            }
        }
        for room_id in emptied {
            self.rooms.remove(&room_id);
        }

        touched
    }

    /// Build the join snapshot of `node_id`'s contribution
    ///
    /// Strategies and index cache entries are global facts, so the full set
    /// is included; re-applying them on the receiver is idempotent.
    pub fn snapshot_for(&self, node_id: &str) -> NodeSnapshot {
        let rooms = self
            .rooms
            .iter()
            .filter_map(|room| {
                room.owners.get(node_id).map(|owner| RoomSnapshot {
                    room_id: room.key().clone(),
                    index: room.index.clone(),
                    collection: room.collection.clone(),
                    filter: room.filter.clone(),
                    subscribers: owner.subscribers,
                })
            })
            .collect();

        let strategies = self
            .strategies
            .iter()
            .map(|entry| AuthStrategyAdded {
                plugin_name: entry.plugin_name.clone(),
                strategy_name: entry.strategy_name.clone(),
                definition: entry.definition.clone(),
            })
            .collect();

        let indexes = self
            .indexes
            .iter()
            .map(|entry| IndexSnapshot {
                scope: entry.key().0,
                index: entry.key().1.clone(),
                collections: entry.collections.iter().cloned().collect(),
            })
            .collect();

        NodeSnapshot {
            version: SYNC_PROTOCOL_VERSION,
            rooms,
            strategies,
            indexes,
        }
    }

    /// Apply a peer's join snapshot as the baseline of its contribution
    pub fn apply_snapshot(&self, node_id: &str, baseline: u64, snapshot: &NodeSnapshot) {
        for room in &snapshot.rooms {
            let mut entry = self
                .rooms
                .entry(room.room_id.clone())
                .or_insert_with(|| RealtimeRoom {
                    index: room.index.clone(),
                    collection: room.collection.clone(),
                    filter: room.filter.clone(),
                    owners: HashMap::new(),
                });
            entry.owners.insert(
                node_id.to_string(),
                RoomOwner {
                    message_id: baseline,
                    subscribers: room.subscribers,
                },
            );
        }

        for strategy in &snapshot.strategies {
            self.add_strategy(AuthStrategyEntry {
                plugin_name: strategy.plugin_name.clone(),
                strategy_name: strategy.strategy_name.clone(),
                definition: strategy.definition.clone(),
            });
        }

        for index in &snapshot.indexes {
            self.add_index(index.scope, &index.index);
            for collection in &index.collections {
                self.add_collection(index.scope, &index.index, collection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn room(id: &str) -> RoomCreated {
        RoomCreated {
            room_id: id.to_string(),
            index: "library".to_string(),
            collection: "books".to_string(),
            filter: "{}".to_string(),
        }
    }

    #[test]
    fn test_subscriber_counts_sum_across_nodes() {
        let state = FullState::new();
        state.add_room("alpha", 1, &room("r-1"));
        state.add_room("beta", 1, &room("r-1"));

        state.add_subscription("alpha", 2, "r-1").unwrap();
        state.add_subscription("alpha", 3, "r-1").unwrap();
        state.add_subscription("beta", 2, "r-1").unwrap();

        assert_eq!(state.subscriber_count("r-1"), 3);
        assert_eq!(state.room_count(), 1);
    }

    #[test]
    fn test_subscription_to_unknown_room_is_an_error() {
        let state = FullState::new();
        let err = state.add_subscription("alpha", 1, "missing").unwrap_err();
        assert!(matches!(err, StateError::UnknownRoom(_)));
    }

    #[test]
    fn test_unsubscription_without_stake_is_an_error() {
        let state = FullState::new();
        state.add_room("alpha", 1, &room("r-1"));
        let err = state.remove_subscription("beta", 2, "r-1").unwrap_err();
        assert!(matches!(err, StateError::UnknownRoomOwner(_, _)));
    }

    #[test]
    fn test_room_dropped_once_unowned() {
        let state = FullState::new();
        state.add_room("alpha", 1, &room("r-1"));
        state.add_room("beta", 1, &room("r-1"));

        state.remove_room("alpha", "r-1");
        assert_eq!(state.room_count(), 1);

        state.remove_room("beta", "r-1");
        assert_eq!(state.room_count(), 0);

        // Converging on an already-removed room is fine
        state.remove_room("beta", "r-1");
    }

    #[test]
    fn test_remove_node_strips_only_that_node() {
        let state = FullState::new();
        state.add_room("alpha", 1, &room("r-1"));
        state.add_room("alpha", 2, &room("r-2"));
        state.add_room("beta", 1, &room("r-1"));
        state.add_subscription("beta", 2, "r-1").unwrap();

        let touched = state.remove_node("alpha");

        assert_eq!(touched, 2);
        assert_eq!(state.room_count(), 1);
        assert_eq!(state.subscriber_count("r-1"), 1);
    }

    #[test]
    fn test_strategies_survive_node_removal() {
        let state = FullState::new();
        state.add_strategy(AuthStrategyEntry {
            plugin_name: "auth-local".to_string(),
            strategy_name: "local".to_string(),
            definition: "{}".to_string(),
        });
        state.add_room("alpha", 1, &room("r-1"));

        state.remove_node("alpha");

        assert!(state.strategy("local").is_some());
        state.remove_strategy("local");
        assert!(state.strategy("local").is_none());
    }

    #[test]
    fn test_index_cache_add_remove() {
        let state = FullState::new();
        state.add_collection(IndexScope::Public, "library", "books");

        assert!(state.has_index(IndexScope::Public, "library"));
        assert!(state.has_collection(IndexScope::Public, "library", "books"));
        assert!(!state.has_index(IndexScope::Internal, "library"));

        state.remove_collection(IndexScope::Public, "library", "books");
        assert!(!state.has_collection(IndexScope::Public, "library", "books"));
        assert!(state.has_index(IndexScope::Public, "library"));

        state.remove_indexes(IndexScope::Public, &["library".to_string()]);
        assert!(!state.has_index(IndexScope::Public, "library"));
    }

    #[test]
    fn test_snapshot_roundtrip_restores_contribution() {
        let origin = FullState::new();
        origin.add_room("alpha", 1, &room("r-1"));
        origin.add_subscription("alpha", 2, "r-1").unwrap();
        origin.add_subscription("alpha", 3, "r-1").unwrap();
        origin.add_room("beta", 1, &room("r-2"));
        origin.add_collection(IndexScope::Public, "library", "books");

        let snapshot = origin.snapshot_for("alpha");
        assert_eq!(snapshot.rooms.len(), 1);
        assert_eq!(snapshot.rooms[0].subscribers, 2);

        let replica = FullState::new();
        replica.apply_snapshot("alpha", 3, &snapshot);

        assert_eq!(replica.subscriber_count("r-1"), 2);
        assert_eq!(replica.room_count(), 1);
        assert!(replica.has_collection(IndexScope::Public, "library", "books"));
    }
}
