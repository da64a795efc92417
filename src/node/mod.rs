//! Cluster Node
//!
//! Ties the replication engine together: owns the full state, one link per
//! discovered peer, the outbound publisher, and the liveness monitor, and
//! arbitrates every eviction decision.
//!
//! Peer discovery rides on chitchat gossip: each node advertises its sync
//! endpoint in its gossip state; a watcher loop opens a link to every newly
//! seen node and locally drops nodes that leave the gossip view.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::events::NodeEvents;
use crate::lease::{LeaseError, RespLeaseStore};
use crate::liveness::{LivenessConfig, LivenessEvent, NodeLivenessMonitor};
use crate::metrics::Metrics;
use crate::protocol::{
    encode_payload, topic, AuthStrategyAdded, AuthStrategyRemoved, ClusterEventPayload,
    CollectionAdded, CollectionRemoved, DocumentNotificationPayload, IndexAdded, IndexScope,
    IndexesRemoved, NodeEvictedPayload, NodeShutdownPayload, ProfileInvalidated, ProtocolError,
    RoleInvalidated, RoomCreated, RoomRemoved, SubscriptionChanged, UserNotificationPayload,
};
use crate::state::{AuthStrategyEntry, FullState};

mod link;
mod publisher;

pub use link::{ClusterLink, LinkState};
pub use publisher::SyncPublisher;

/// Gossip state key advertising the sync endpoint
const KEY_SYNC_ADDR: &str = "sync_addr";

/// Eviction decisions flowing from links and handlers to the controller
#[derive(Debug)]
pub enum NodeRequest {
    /// Remove a remote node from the trusted membership
    EvictPeer {
        node_id: String,
        reason: String,
        broadcast: bool,
    },
    /// The local node can no longer guarantee correctness and must leave
    EvictSelf { reason: String },
}

/// Node error types
#[derive(Debug)]
pub enum NodeError {
    /// Liveness lease store failure
    Lease(LeaseError),
    /// Sync listener failure
    Io(std::io::Error),
    /// Gossip layer failure
    Gossip(String),
    /// The node was started twice
    AlreadyStarted,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Lease(e) => write!(f, "lease store error: {}", e),
            NodeError::Io(e) => write!(f, "IO error: {}", e),
            NodeError::Gossip(msg) => write!(f, "gossip error: {}", msg),
            NodeError::AlreadyStarted => write!(f, "node already started"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Lease(e) => Some(e),
            NodeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LeaseError> for NodeError {
    fn from(err: LeaseError) -> Self {
        NodeError::Lease(err)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err)
    }
}

/// One clustered node of the replication engine
pub struct ClusterNode {
    node_id: String,
    config: Config,
    full_state: Arc<FullState>,
    links: Arc<DashMap<String, ClusterLink>>,
    publisher: Arc<SyncPublisher>,
    events: NodeEvents,
    metrics: Arc<Metrics>,
    requests_tx: mpsc::UnboundedSender<NodeRequest>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeRequest>>>,
    liveness: Mutex<Option<NodeLivenessMonitor>>,
    gossip: Mutex<Option<ChitchatHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClusterNode {
    pub fn new(config: Config) -> Self {
        let node_id = config.node.get_node_id();
        let full_state = Arc::new(FullState::new());
        let metrics = Arc::new(Metrics::new());
        let publisher = Arc::new(SyncPublisher::new(
            node_id.clone(),
            full_state.clone(),
            metrics.clone(),
        ));
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            node_id,
            config,
            full_state,
            links: Arc::new(DashMap::new()),
            publisher,
            events: NodeEvents::new(),
            metrics,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            liveness: Mutex::new(None),
            gossip: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn full_state(&self) -> &Arc<FullState> {
        &self.full_state
    }

    pub fn events(&self) -> &NodeEvents {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Number of links currently held
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Observe the shutdown signal; flips to true on self-eviction or
    /// graceful shutdown
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Bring the node online: sync listener, liveness lease, gossip
    /// discovery, heartbeat emission
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let requests_rx = self
            .requests_rx
            .lock()
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        info!(
            "Starting cluster node '{}' (sync={}, gossip={})",
            self.node_id, self.config.sync.bind_addr, self.config.gossip.bind_addr
        );

        // Outbound sync channel
        self.publisher
            .bind(self.config.sync.bind_addr, self.shutdown_signal())
            .await?;

        // Liveness lease over a dedicated store connection, so that renewal
        // latency is never a function of main-path load
        let (liveness_tx, liveness_rx) = mpsc::unbounded_channel();
        let store = Arc::new(RespLeaseStore::connect(&self.config.lease.addr).await?);
        let monitor = NodeLivenessMonitor::start(
            store,
            LivenessConfig {
                lease_key: self.config.lease.lease_key(&self.node_id),
                refresh_delay: self.config.lease.refresh_delay,
            },
            liveness_tx,
        )
        .await?;
        *self.liveness.lock() = Some(monitor);

        // Gossip membership
        let gossip_advertise = self.config.gossip.advertise_addr();
        let sync_advertise = self.config.sync.advertise_addr();
        let chitchat_id = ChitchatId::new(self.node_id.clone(), 0, gossip_advertise);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: self.config.gossip.interval,
            ..Default::default()
        };
        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: self.config.gossip.cluster_id.clone(),
            gossip_interval: self.config.gossip.interval,
            listen_addr: self.config.gossip.bind_addr,
            seed_nodes: self.config.gossip.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: self.config.gossip.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };
        let initial_kvs = vec![(KEY_SYNC_ADDR.to_string(), sync_advertise.to_string())];
        let handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| NodeError::Gossip(e.to_string()))?;
        let chitchat = handle.chitchat();
        *self.gossip.lock() = Some(handle);

        // Background loops
        let node = self.clone();
        tokio::spawn(async move {
            node.command_loop(requests_rx, liveness_rx).await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.discovery_loop(chitchat).await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.heartbeat_loop().await;
        });

        info!("Cluster node '{}' started", self.node_id);
        Ok(())
    }

    /// Consume eviction requests from links and fatal signals from the
    /// liveness monitor
    async fn command_loop(
        self: Arc<Self>,
        mut requests_rx: mpsc::UnboundedReceiver<NodeRequest>,
        mut liveness_rx: mpsc::UnboundedReceiver<LivenessEvent>,
    ) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                Some(request) = requests_rx.recv() => match request {
                    NodeRequest::EvictPeer { node_id, reason, broadcast } => {
                        self.evict_node(&node_id, broadcast, &reason).await;
                    }
                    NodeRequest::EvictSelf { reason } => {
                        self.evict_self(&reason).await;
                        return;
                    }
                },
                Some(LivenessEvent::Fatal(reason)) = liveness_rx.recv() => {
                    self.evict_self(&reason).await;
                    return;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Watch the gossip view: link up new nodes, drop departed ones
    async fn discovery_loop(
        self: Arc<Self>,
        chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
    ) {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.gossip.interval) => {}
                _ = shutdown.changed() => return,
            }

            let snapshot = {
                let cc = chitchat.lock().await;
                cc.state_snapshot()
            };

            for node_state in &snapshot.node_states {
                let peer_id = node_state.chitchat_id().node_id.clone();
                if peer_id == self.node_id || self.links.contains_key(&peer_id) {
                    continue;
                }
                let Some(addr_str) = node_state.get(KEY_SYNC_ADDR) else {
                    continue;
                };
                let Ok(peer_addr) = addr_str.parse::<SocketAddr>() else {
                    warn!(
                        "Peer '{}' advertises unparseable sync address '{}'",
                        peer_id, addr_str
                    );
                    continue;
                };

                info!("Discovered cluster peer '{}' at sync={}", peer_id, peer_addr);
                let link = ClusterLink::new(
                    peer_id.clone(),
                    peer_addr,
                    self.node_id.clone(),
                    self.config.node.heartbeat_delay,
                    self.full_state.clone(),
                    self.events.clone(),
                    self.requests_tx.clone(),
                    self.metrics.clone(),
                );
                link.spawn();
                self.links.insert(peer_id, link);
                self.metrics.links_current.inc();
            }

            // Nodes gone from the gossip view are dropped locally; each
            // remaining node reaches the same conclusion on its own
            let current: HashSet<String> = snapshot
                .node_states
                .iter()
                .map(|ns| ns.chitchat_id().node_id.clone())
                .collect();
            let departed: Vec<String> = self
                .links
                .iter()
                .filter(|entry| !current.contains(entry.key()))
                .map(|entry| entry.key().clone())
                .collect();
            for node_id in departed {
                self.evict_node(&node_id, false, "left the gossip view").await;
            }
        }
    }

    /// Emit explicit proof-of-life on the sync channel
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut timer = tokio::time::interval(self.config.node.heartbeat_delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.publisher.publish(topic::HEARTBEAT, Vec::new());
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Remove a remote node from the trusted membership
    ///
    /// Idempotent: a node may be independently evicted by several peers, or
    /// by the same peer through both a link error and a gossip departure.
    pub async fn evict_node(&self, node_id: &str, broadcast: bool, reason: &str) {
        if node_id == self.node_id {
            // A notice naming us is a verdict on our own correctness
            self.evict_self(reason).await;
            return;
        }

        if let Some((_, link)) = self.links.remove(node_id) {
            link.dispose();
            self.metrics.links_current.dec();
        }
        let touched = self.full_state.remove_node(node_id);
        self.metrics.peer_evictions_total.inc();
        warn!(
            "Evicted node '{}' ({} rooms affected): {}",
            node_id, touched, reason
        );

        if broadcast {
            self.publish_payload(
                topic::NODE_EVICTED,
                &NodeEvictedPayload {
                    node_id: node_id.to_string(),
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// Leave the cluster over a local correctness violation
    ///
    /// Unlike a peer eviction this is always fatal: the node stops serving
    /// because it cannot prove its replica or its liveness is correct.
    pub async fn evict_self(&self, reason: &str) {
        error!("Evicting local node '{}': {}", self.node_id, reason);
        self.metrics.self_evictions_total.inc();
        self.teardown().await;
    }

    /// Leave the cluster gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down cluster node '{}'", self.node_id);
        self.teardown().await;
    }

    async fn teardown(&self) {
        // send_replace makes concurrent teardowns race-free: exactly one
        // caller observes the false -> true edge and runs the cleanup
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        // Best-effort departure notice; peers also find out through the
        // lease and the gossip view
        self.publish_payload(
            topic::NODE_SHUTDOWN,
            &NodeShutdownPayload {
                node_id: self.node_id.clone(),
            },
        );

        let monitor = self.liveness.lock().take();
        if let Some(monitor) = monitor {
            monitor.dispose().await;
        }

        for entry in self.links.iter() {
            entry.value().dispose();
        }
        self.links.clear();
        self.metrics.links_current.set(0);

        // Dropping the handle stops the gossip task
        self.gossip.lock().take();
    }

    // ------------------------------------------------------------------
    // Local mutation API: apply to the local replica and replicate out.
    // State-bearing updates run under the publisher lock so join snapshots
    // can never disagree with their sequence baseline.
    // ------------------------------------------------------------------

    /// Register a realtime room created on this node
    pub fn create_room(&self, room_id: &str, index: &str, collection: &str, filter: &str) {
        let payload = RoomCreated {
            room_id: room_id.to_string(),
            index: index.to_string(),
            collection: collection.to_string(),
            filter: filter.to_string(),
        };
        self.publish_applied(topic::ROOM_CREATED, &payload, |id| {
            self.full_state.add_room(&self.node_id, id, &payload);
        });
    }

    /// Drop this node's interest in a realtime room
    pub fn remove_room(&self, room_id: &str) {
        let payload = RoomRemoved {
            room_id: room_id.to_string(),
        };
        self.publish_applied(topic::ROOM_REMOVED, &payload, |_| {
            self.full_state.remove_room(&self.node_id, room_id);
        });
    }

    /// Count a new local subscriber on a room
    pub fn add_subscription(&self, room_id: &str) {
        let payload = SubscriptionChanged {
            room_id: room_id.to_string(),
        };
        self.publish_applied(topic::SUBSCRIPTION_ADDED, &payload, |id| {
            if let Err(e) = self.full_state.add_subscription(&self.node_id, id, room_id) {
                warn!("Local subscription on unknown room: {}", e);
            }
        });
    }

    /// Drop a local subscriber from a room
    pub fn remove_subscription(&self, room_id: &str) {
        let payload = SubscriptionChanged {
            room_id: room_id.to_string(),
        };
        self.publish_applied(topic::SUBSCRIPTION_REMOVED, &payload, |id| {
            if let Err(e) = self
                .full_state
                .remove_subscription(&self.node_id, id, room_id)
            {
                warn!("Local unsubscription on unknown room: {}", e);
            }
        });
    }

    /// Register an authentication strategy cluster-wide
    pub fn register_strategy(&self, plugin_name: &str, strategy_name: &str, definition: &str) {
        let payload = AuthStrategyAdded {
            plugin_name: plugin_name.to_string(),
            strategy_name: strategy_name.to_string(),
            definition: definition.to_string(),
        };
        self.publish_applied(topic::AUTH_STRATEGY_ADDED, &payload, |_| {
            self.full_state.add_strategy(AuthStrategyEntry {
                plugin_name: plugin_name.to_string(),
                strategy_name: strategy_name.to_string(),
                definition: definition.to_string(),
            });
        });
    }

    /// Remove an authentication strategy cluster-wide
    pub fn unregister_strategy(&self, plugin_name: &str, strategy_name: &str) {
        let payload = AuthStrategyRemoved {
            plugin_name: plugin_name.to_string(),
            strategy_name: strategy_name.to_string(),
        };
        self.publish_applied(topic::AUTH_STRATEGY_REMOVED, &payload, |_| {
            self.full_state.remove_strategy(strategy_name);
        });
    }

    /// Mark an index as existing
    pub fn index_added(&self, scope: IndexScope, index: &str) {
        let payload = IndexAdded {
            scope,
            index: index.to_string(),
        };
        self.publish_applied(topic::INDEX_ADDED, &payload, |_| {
            self.full_state.add_index(scope, index);
        });
    }

    /// Drop indexes from the cache
    pub fn indexes_removed(&self, scope: IndexScope, indexes: &[String]) {
        let payload = IndexesRemoved {
            scope,
            indexes: indexes.to_vec(),
        };
        self.publish_applied(topic::INDEXES_REMOVED, &payload, |_| {
            self.full_state.remove_indexes(scope, indexes);
        });
    }

    /// Mark a collection as existing
    pub fn collection_added(&self, scope: IndexScope, index: &str, collection: &str) {
        let payload = CollectionAdded {
            scope,
            index: index.to_string(),
            collection: collection.to_string(),
        };
        self.publish_applied(topic::COLLECTION_ADDED, &payload, |_| {
            self.full_state.add_collection(scope, index, collection);
        });
    }

    /// Drop a collection from the cache
    pub fn collection_removed(&self, scope: IndexScope, index: &str, collection: &str) {
        let payload = CollectionRemoved {
            scope,
            index: index.to_string(),
            collection: collection.to_string(),
        };
        self.publish_applied(topic::COLLECTION_REMOVED, &payload, |_| {
            self.full_state.remove_collection(scope, index, collection);
        });
    }

    /// Re-emit an application event on every node
    pub fn broadcast_event(&self, event: &str, payload: &[u8]) {
        self.publish_payload(
            topic::CLUSTER_EVENT,
            &ClusterEventPayload {
                event: event.to_string(),
                payload: payload.to_vec(),
            },
        );
    }

    /// Re-deliver a document notification to subscribers on every node
    pub fn notify_documents(&self, rooms: &[String], notification: &[u8]) {
        self.publish_payload(
            topic::DOCUMENT_NOTIFICATION,
            &DocumentNotificationPayload {
                rooms: rooms.to_vec(),
                notification: notification.to_vec(),
            },
        );
    }

    /// Re-deliver a user notification to subscribers on every node
    pub fn notify_user(&self, room: &str, notification: &[u8]) {
        self.publish_payload(
            topic::USER_NOTIFICATION,
            &UserNotificationPayload {
                room: room.to_string(),
                notification: notification.to_vec(),
            },
        );
    }

    /// Invalidate a security profile cluster-wide
    pub fn invalidate_profile(&self, profile_id: &str) {
        self.publish_payload(
            topic::PROFILE_INVALIDATED,
            &ProfileInvalidated {
                profile_id: profile_id.to_string(),
            },
        );
    }

    /// Invalidate a security role cluster-wide
    pub fn invalidate_role(&self, role_id: &str) {
        self.publish_payload(
            topic::ROLE_INVALIDATED,
            &RoleInvalidated {
                role_id: role_id.to_string(),
            },
        );
    }

    /// Ask every node to reload its document validators
    pub fn refresh_validators(&self) {
        self.publisher
            .publish(topic::VALIDATORS_REFRESHED, Vec::new());
    }

    fn publish_payload<T: bincode::Encode>(&self, topic_name: &str, payload: &T) {
        match encode_payload(payload) {
            Ok(bytes) => {
                self.publisher.publish(topic_name, bytes);
            }
            Err(e) => self.log_encode_failure(topic_name, e),
        }
    }

    fn publish_applied<T, F>(&self, topic_name: &str, payload: &T, apply: F)
    where
        T: bincode::Encode,
        F: FnOnce(u64),
    {
        match encode_payload(payload) {
            Ok(bytes) => {
                self.publisher.publish_applied(topic_name, bytes, apply);
            }
            Err(e) => self.log_encode_failure(topic_name, e),
        }
    }

    fn log_encode_failure(&self, topic_name: &str, err: ProtocolError) {
        error!("Failed to encode '{}' payload: {}", topic_name, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Arc<ClusterNode> {
        Arc::new(ClusterNode::new(Config::default()))
    }

    #[tokio::test]
    async fn test_local_mutations_are_sequenced_and_applied() {
        let node = node();

        node.create_room("r-1", "library", "books", "{}");
        node.add_subscription("r-1");
        node.add_subscription("r-1");
        node.remove_subscription("r-1");

        assert_eq!(node.full_state().subscriber_count("r-1"), 1);
        assert_eq!(node.publisher.last_message_id(), 4);

        let snapshot = node.full_state().snapshot_for(node.node_id());
        assert_eq!(snapshot.rooms.len(), 1);
        assert_eq!(snapshot.rooms[0].subscribers, 1);
    }

    #[tokio::test]
    async fn test_evicting_an_unknown_node_is_idempotent() {
        let node = node();
        node.evict_node("ghost", false, "never seen").await;
        node.evict_node("ghost", true, "never seen").await;
        assert_eq!(node.link_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_notice_naming_self_shuts_the_node_down() {
        let node = node();
        let mut shutdown = node.shutdown_signal();
        assert!(!*shutdown.borrow());

        let local = node.node_id().to_string();
        node.evict_node(&local, true, "peer decided we are dead").await;

        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let node = node();
        node.shutdown().await;
        node.shutdown().await;
        assert!(*node.shutdown_signal().borrow());
    }
}
