//! Cluster Link
//!
//! The subscriber-side state machine paired with one remote node's publish
//! stream. A link buffers traffic until the peer's join snapshot gives it a
//! trustworthy baseline, then validates strict message ordering and applies
//! every update to the full state.
//!
//! A link never repairs itself: a protocol violation or dead receive path
//! evicts the remote peer, and a local correctness violation (sequence gap,
//! handler failure) evicts the local node, because a replica of unknown
//! consistency must not keep serving.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{NodeEvents, Notification, RemoteEvent, SecuritySignal};
use crate::metrics::Metrics;
use crate::protocol::{
    decode_payload, read_envelope, topic, AuthStrategyAdded, AuthStrategyRemoved,
    ClusterEventPayload, CollectionAdded, CollectionRemoved, DocumentNotificationPayload,
    Envelope, IndexAdded, IndexesRemoved, NodeEvictedPayload, NodeShutdownPayload, NodeSnapshot,
    ProfileInvalidated, ProtocolError, RoleInvalidated, RoomCreated, RoomRemoved,
    SubscriptionChanged, TopicKind, UserNotificationPayload, SYNC_PROTOCOL_VERSION,
};
use crate::state::{AuthStrategyEntry, FullState, StateError};

use super::NodeRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Just (re)established; inbound traffic is queued, not applied
    Buffering,
    /// Peer is live and messages are applied in order
    Sane,
    /// No traffic within the staleness threshold; one grace interval left
    MissingHeartbeat,
    /// Terminal; the link is torn down
    Evicted,
}

/// Why applying one message failed
enum ApplyError {
    /// The payload did not match its topic schema; the peer is at fault
    Decode(ProtocolError),
    /// The full state rejected the mutation; the local replica is at fault
    Handler(StateError),
}

impl From<ProtocolError> for ApplyError {
    fn from(err: ProtocolError) -> Self {
        ApplyError::Decode(err)
    }
}

impl From<StateError> for ApplyError {
    fn from(err: StateError) -> Self {
        ApplyError::Handler(err)
    }
}

struct LinkShared {
    peer_id: String,
    peer_addr: SocketAddr,
    local_node_id: String,
    heartbeat_delay: Duration,
    full_state: Arc<FullState>,
    events: NodeEvents,
    requests: tokio::sync::mpsc::UnboundedSender<NodeRequest>,
    metrics: Arc<Metrics>,

    state: RwLock<LinkState>,
    /// Last accepted sequence number; None until the first id is seen
    last_message_id: Mutex<Option<u64>>,
    /// Whether a join sync has completed on this link instance
    synced: AtomicBool,
    /// Traffic queued while buffering, in arrival order
    buffer: Mutex<Vec<Envelope>>,
    last_heartbeat: Mutex<Instant>,
    shutdown: Notify,
}

/// Replication link to one remote node
#[derive(Clone)]
pub struct ClusterLink {
    shared: Arc<LinkShared>,
}

impl ClusterLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: String,
        peer_addr: SocketAddr,
        local_node_id: String,
        heartbeat_delay: Duration,
        full_state: Arc<FullState>,
        events: NodeEvents,
        requests: tokio::sync::mpsc::UnboundedSender<NodeRequest>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                peer_id,
                peer_addr,
                local_node_id,
                heartbeat_delay,
                full_state,
                events,
                requests,
                metrics,
                state: RwLock::new(LinkState::Buffering),
                last_message_id: Mutex::new(None),
                synced: AtomicBool::new(false),
                buffer: Mutex::new(Vec::new()),
                last_heartbeat: Mutex::new(Instant::now()),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Remote node this link tracks
    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.shared.state.read()
    }

    /// Last accepted sequence number
    pub fn last_message_id(&self) -> Option<u64> {
        *self.shared.last_message_id.lock()
    }

    /// Messages currently queued for replay
    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Connect to the peer's sync endpoint and run the receive loop
    pub fn spawn(&self) {
        let link = self.clone();
        tokio::spawn(async move {
            link.run().await;
        });
    }

    async fn run(&self) {
        let stream = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(self.shared.peer_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.evict_peer(format!("sync connect failed: {}", e));
                return;
            }
            Err(_) => {
                self.evict_peer(format!(
                    "sync connect to {} timed out",
                    self.shared.peer_addr
                ));
                return;
            }
        };
        debug!(
            "Link '{}': connected to {}",
            self.shared.peer_id, self.shared.peer_addr
        );

        // The connection itself counts as first proof of life
        self.touch_heartbeat();

        // Frame reads run on their own task: read_exact is not safe to
        // cancel mid-frame, and the select below would do exactly that on
        // every timer tick. Channel receives are.
        let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let received = read_envelope(&mut stream).await;
                let failed = received.is_err();
                if frame_tx.send(received).is_err() || failed {
                    return;
                }
            }
        });

        let mut heartbeat_timer = tokio::time::interval_at(
            Instant::now() + self.shared.heartbeat_delay,
            self.shared.heartbeat_delay,
        );

        loop {
            if self.state() == LinkState::Evicted {
                return;
            }
            tokio::select! {
                received = frame_rx.recv() => match received {
                    Some(Ok(envelope)) => self.on_envelope(envelope),
                    Some(Err(e)) => {
                        // A broken receive path is indistinguishable from
                        // the peer being gone
                        self.evict_peer(format!("sync stream receive failed: {}", e));
                        return;
                    }
                    None => return,
                },
                _ = heartbeat_timer.tick() => self.check_heartbeat(),
                _ = self.shared.shutdown.notified() => return,
            }
        }
    }

    /// Route one received envelope
    ///
    /// Until the join sync completes, the peer's confirmed state has not
    /// been baselined locally; applying deltas would produce a partial
    /// view, so everything but the snapshot itself is queued.
    pub(crate) fn on_envelope(&self, envelope: Envelope) {
        if self.state() == LinkState::Evicted {
            return;
        }
        if !self.shared.synced.load(Ordering::SeqCst) {
            if envelope.topic == topic::SNAPSHOT {
                self.handle_snapshot(envelope);
            } else {
                self.shared.metrics.messages_buffered_total.inc();
                self.shared.buffer.lock().push(envelope);
            }
            return;
        }
        self.process_data(envelope);
    }

    /// Apply the peer's join snapshot and replay everything buffered behind
    /// its baseline
    fn handle_snapshot(&self, envelope: Envelope) {
        let Some(baseline) = envelope.message_id else {
            self.evict_peer("missing messageId on snapshot".to_string());
            return;
        };
        let snapshot: NodeSnapshot = match decode_payload(&envelope.payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.evict_peer(format!("undecodable snapshot: {}", e));
                return;
            }
        };
        if snapshot.version != SYNC_PROTOCOL_VERSION {
            self.evict_peer(format!(
                "protocol version mismatch: {} vs {}",
                snapshot.version, SYNC_PROTOCOL_VERSION
            ));
            return;
        }

        self.shared
            .full_state
            .apply_snapshot(&self.shared.peer_id, baseline, &snapshot);
        self.touch_heartbeat();
        info!(
            "Link '{}': snapshot applied ({} rooms, baseline {})",
            self.shared.peer_id,
            snapshot.rooms.len(),
            baseline
        );
        self.sync(baseline);
    }

    /// Set the sequence baseline, replay the buffer in arrival order, and go
    /// live
    pub(crate) fn sync(&self, last_message_id: u64) {
        *self.shared.last_message_id.lock() = Some(last_message_id);

        // Replay runs before the synced flag flips, so validation stays in
        // its lenient pre-sync mode: messages the baseline already covers
        // are dropped, not treated as gaps
        let queued = std::mem::take(&mut *self.shared.buffer.lock());
        let replayed = queued.len();
        for envelope in queued {
            if self.state() == LinkState::Evicted {
                return;
            }
            self.process_data(envelope);
        }

        self.shared.synced.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.write();
        if *state != LinkState::Evicted {
            *state = LinkState::Sane;
            debug!(
                "Link '{}': sane after replaying {} buffered messages",
                self.shared.peer_id, replayed
            );
        }
    }

    /// Validate and apply one message
    pub(crate) fn process_data(&self, envelope: Envelope) {
        if self.state() == LinkState::Evicted {
            return;
        }

        let Some(kind) = TopicKind::lookup(&envelope.topic) else {
            self.evict_peer(format!("unknown sync topic \"{}\"", envelope.topic));
            return;
        };

        let Some(message_id) = self.validate(&envelope) else {
            return;
        };

        // Every valid message counts as proof of life, not only heartbeats
        self.touch_heartbeat();

        match self.apply(kind, message_id, &envelope) {
            Ok(()) => self.shared.metrics.messages_applied_total.inc(),
            Err(ApplyError::Decode(e)) => {
                self.evict_peer(format!(
                    "undecodable \"{}\" payload: {}",
                    envelope.topic, e
                ));
            }
            Err(ApplyError::Handler(e)) => {
                // The replica may be partially mutated; it can no longer be
                // trusted
                self.evict_self(format!(
                    "applying \"{}\" from {} failed: {}",
                    envelope.topic, self.shared.peer_id, e
                ));
            }
        }
    }

    /// Sequence validation; returns the accepted id or None when the message
    /// must be dropped
    fn validate(&self, envelope: &Envelope) -> Option<u64> {
        let Some(message_id) = envelope.message_id else {
            self.evict_peer(format!(
                "missing messageId on topic \"{}\"",
                envelope.topic
            ));
            return None;
        };

        let mut last = self.shared.last_message_id.lock();

        if !self.shared.synced.load(Ordering::SeqCst) {
            if let Some(prev) = *last {
                // Replaying during sync: anything out of sequence pre-dates
                // the snapshot baseline and is already accounted for
                if message_id != prev + 1 {
                    debug!(
                        "Link '{}': dropping replayed message {} (expected {})",
                        self.shared.peer_id,
                        message_id,
                        prev + 1
                    );
                    return None;
                }
            }
            *last = Some(message_id);
            return Some(message_id);
        }

        if let Some(prev) = *last {
            if message_id != prev + 1 {
                drop(last);
                // Updates were missed on the receiving side; unlike a peer
                // failure this is a local correctness violation
                self.evict_self(format!(
                    "sequence gap on link {} (expected {}, got {})",
                    self.shared.peer_id,
                    prev + 1,
                    message_id
                ));
                return None;
            }
        }
        *last = Some(message_id);
        Some(message_id)
    }

    /// Dispatch one validated message to its full-state handler
    fn apply(
        &self,
        kind: TopicKind,
        message_id: u64,
        envelope: &Envelope,
    ) -> Result<(), ApplyError> {
        let peer = self.shared.peer_id.as_str();
        let state = &self.shared.full_state;

        match kind {
            // Timestamp refresh already happened in process_data
            TopicKind::Heartbeat => {}
            TopicKind::Snapshot => {
                debug!("Link '{}': ignoring snapshot outside join", peer);
            }
            TopicKind::RoomCreated => {
                let payload: RoomCreated = decode_payload(&envelope.payload)?;
                state.add_room(peer, message_id, &payload);
            }
            TopicKind::RoomRemoved => {
                let payload: RoomRemoved = decode_payload(&envelope.payload)?;
                state.remove_room(peer, &payload.room_id);
            }
            TopicKind::SubscriptionAdded => {
                let payload: SubscriptionChanged = decode_payload(&envelope.payload)?;
                state.add_subscription(peer, message_id, &payload.room_id)?;
            }
            TopicKind::SubscriptionRemoved => {
                let payload: SubscriptionChanged = decode_payload(&envelope.payload)?;
                state.remove_subscription(peer, message_id, &payload.room_id)?;
            }
            TopicKind::ClusterEvent => {
                let payload: ClusterEventPayload = decode_payload(&envelope.payload)?;
                self.shared.events.emit_cluster(RemoteEvent {
                    origin: peer.to_string(),
                    event: payload.event,
                    payload: payload.payload.into(),
                });
            }
            TopicKind::DocumentNotification => {
                let payload: DocumentNotificationPayload = decode_payload(&envelope.payload)?;
                self.shared.events.emit_notification(Notification::Document {
                    origin: peer.to_string(),
                    rooms: payload.rooms,
                    payload: payload.notification.into(),
                });
            }
            TopicKind::UserNotification => {
                let payload: UserNotificationPayload = decode_payload(&envelope.payload)?;
                self.shared.events.emit_notification(Notification::User {
                    origin: peer.to_string(),
                    room: payload.room,
                    payload: payload.notification.into(),
                });
            }
            TopicKind::AuthStrategyAdded => {
                let payload: AuthStrategyAdded = decode_payload(&envelope.payload)?;
                state.add_strategy(AuthStrategyEntry {
                    plugin_name: payload.plugin_name,
                    strategy_name: payload.strategy_name,
                    definition: payload.definition,
                });
            }
            TopicKind::AuthStrategyRemoved => {
                let payload: AuthStrategyRemoved = decode_payload(&envelope.payload)?;
                state.remove_strategy(&payload.strategy_name);
            }
            TopicKind::IndexAdded => {
                let payload: IndexAdded = decode_payload(&envelope.payload)?;
                state.add_index(payload.scope, &payload.index);
            }
            TopicKind::IndexesRemoved => {
                let payload: IndexesRemoved = decode_payload(&envelope.payload)?;
                state.remove_indexes(payload.scope, &payload.indexes);
            }
            TopicKind::CollectionAdded => {
                let payload: CollectionAdded = decode_payload(&envelope.payload)?;
                state.add_collection(payload.scope, &payload.index, &payload.collection);
            }
            TopicKind::CollectionRemoved => {
                let payload: CollectionRemoved = decode_payload(&envelope.payload)?;
                state.remove_collection(payload.scope, &payload.index, &payload.collection);
            }
            TopicKind::ProfileInvalidated => {
                let payload: ProfileInvalidated = decode_payload(&envelope.payload)?;
                self.shared
                    .events
                    .emit_security(SecuritySignal::ProfileInvalidated {
                        profile_id: payload.profile_id,
                    });
            }
            TopicKind::RoleInvalidated => {
                let payload: RoleInvalidated = decode_payload(&envelope.payload)?;
                self.shared
                    .events
                    .emit_security(SecuritySignal::RoleInvalidated {
                        role_id: payload.role_id,
                    });
            }
            TopicKind::ValidatorsRefreshed => {
                self.shared
                    .events
                    .emit_security(SecuritySignal::ValidatorsRefreshed);
            }
            TopicKind::NodeEvicted => {
                let payload: NodeEvictedPayload = decode_payload(&envelope.payload)?;
                if payload.node_id == self.shared.local_node_id {
                    // A peer evicting us is indistinguishable from finding
                    // out we are wrong: shut down, do not argue
                    self.request(NodeRequest::EvictSelf {
                        reason: format!("evicted by {}: {}", peer, payload.reason),
                    });
                } else {
                    self.request(NodeRequest::EvictPeer {
                        node_id: payload.node_id,
                        reason: payload.reason,
                        broadcast: false,
                    });
                }
            }
            TopicKind::NodeShutdown => {
                let payload: NodeShutdownPayload = decode_payload(&envelope.payload)?;
                self.request(NodeRequest::EvictPeer {
                    node_id: payload.node_id,
                    reason: "peer shut down".to_string(),
                    broadcast: false,
                });
            }
        }

        Ok(())
    }

    /// Compare observed staleness against the threshold and transition
    pub(crate) fn check_heartbeat(&self) {
        let state = self.state();
        if state == LinkState::Evicted {
            return;
        }

        let elapsed = self.shared.last_heartbeat.lock().elapsed();
        let threshold = self.shared.heartbeat_delay * 3 / 2;

        if elapsed <= threshold {
            if state == LinkState::MissingHeartbeat {
                // Recover once traffic resumes; a link that never synced goes
                // back to buffering, not straight to live
                let recovered = if self.shared.synced.load(Ordering::SeqCst) {
                    LinkState::Sane
                } else {
                    LinkState::Buffering
                };
                *self.shared.state.write() = recovered;
                debug!(
                    "Link '{}': heartbeat recovered ({:?})",
                    self.shared.peer_id, recovered
                );
            }
            return;
        }

        match state {
            LinkState::MissingHeartbeat => {
                self.evict_peer(format!(
                    "heartbeat timeout ({}ms without traffic)",
                    elapsed.as_millis()
                ));
            }
            LinkState::Sane | LinkState::Buffering => {
                // One grace interval before eviction avoids flapping on a
                // single delayed packet
                self.shared.metrics.heartbeat_misses_total.inc();
                warn!(
                    "Link '{}': no traffic for {}ms, heartbeat missing",
                    self.shared.peer_id,
                    elapsed.as_millis()
                );
                *self.shared.state.write() = LinkState::MissingHeartbeat;
            }
            LinkState::Evicted => {}
        }
    }

    fn touch_heartbeat(&self) {
        *self.shared.last_heartbeat.lock() = Instant::now();
    }

    /// Evict the remote peer, broadcasting the decision cluster-wide
    fn evict_peer(&self, reason: String) {
        if !self.transition_to_evicted() {
            return;
        }
        warn!("Link '{}': evicting peer: {}", self.shared.peer_id, reason);
        self.request(NodeRequest::EvictPeer {
            node_id: self.shared.peer_id.clone(),
            reason,
            broadcast: true,
        });
    }

    /// Evict the local node; the link is done either way
    fn evict_self(&self, reason: String) {
        self.transition_to_evicted();
        self.request(NodeRequest::EvictSelf { reason });
    }

    fn request(&self, request: NodeRequest) {
        let _ = self.shared.requests.send(request);
    }

    /// Force the terminal state; true when this call made the transition
    fn transition_to_evicted(&self) -> bool {
        let mut state = self.shared.state.write();
        if *state == LinkState::Evicted {
            return false;
        }
        *state = LinkState::Evicted;
        self.shared.shutdown.notify_waiters();
        true
    }

    /// Tear the link down: terminal state, receive loop stopped, socket
    /// dropped. Idempotent, and safe against in-flight timer callbacks and
    /// receives, which all check the state before acting.
    pub fn dispose(&self) {
        if self.transition_to_evicted() {
            debug!("Link '{}': disposed", self.shared.peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::time::{advance, Duration};

    use crate::protocol::encode_payload;

    use super::*;

    const HEARTBEAT_DELAY: Duration = Duration::from_millis(100);

    struct Harness {
        link: ClusterLink,
        state: Arc<FullState>,
        requests: mpsc::UnboundedReceiver<NodeRequest>,
        events: NodeEvents,
    }

    fn harness() -> Harness {
        let state = Arc::new(FullState::new());
        let events = NodeEvents::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ClusterLink::new(
            "remote".to_string(),
            "127.0.0.1:9".parse().unwrap(),
            "local".to_string(),
            HEARTBEAT_DELAY,
            state.clone(),
            events.clone(),
            tx,
            Arc::new(Metrics::new()),
        );
        Harness {
            link,
            state,
            requests: rx,
            events,
        }
    }

    fn room_envelope(id: u64, room_id: &str) -> Envelope {
        let payload = RoomCreated {
            room_id: room_id.to_string(),
            index: "library".to_string(),
            collection: "books".to_string(),
            filter: "{}".to_string(),
        };
        Envelope {
            topic: topic::ROOM_CREATED.to_string(),
            message_id: Some(id),
            payload: encode_payload(&payload).unwrap(),
        }
    }

    fn subscription_envelope(id: u64, room_id: &str) -> Envelope {
        let payload = SubscriptionChanged {
            room_id: room_id.to_string(),
        };
        Envelope {
            topic: topic::SUBSCRIPTION_ADDED.to_string(),
            message_id: Some(id),
            payload: encode_payload(&payload).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_buffering_queues_without_mutating() {
        let mut h = harness();

        h.link.on_envelope(room_envelope(1, "r-1"));
        h.link.on_envelope(subscription_envelope(2, "r-1"));

        assert_eq!(h.link.state(), LinkState::Buffering);
        assert_eq!(h.link.buffered_len(), 2);
        assert_eq!(h.state.room_count(), 0);
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_replays_buffer_in_order() {
        let mut h = harness();

        h.link.on_envelope(room_envelope(1, "r-1"));
        h.link.on_envelope(subscription_envelope(2, "r-1"));
        h.link.sync(0);

        assert_eq!(h.link.state(), LinkState::Sane);
        assert_eq!(h.link.buffered_len(), 0);
        assert_eq!(h.link.last_message_id(), Some(2));
        assert_eq!(h.state.room_count(), 1);
        assert_eq!(h.state.subscriber_count("r-1"), 1);
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replay_drops_messages_behind_the_baseline() {
        let mut h = harness();

        // Ids 1 and 2 arrived before the snapshot; its baseline already
        // covers them
        h.link.on_envelope(room_envelope(1, "r-1"));
        h.link.on_envelope(room_envelope(2, "r-2"));
        h.link.on_envelope(room_envelope(3, "r-3"));
        h.link.sync(2);

        assert_eq!(h.link.state(), LinkState::Sane);
        assert_eq!(h.state.room_count(), 1);
        assert!(h.state.room("r-3").is_some());
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ordered_messages_apply_while_sane() {
        let mut h = harness();
        h.link.sync(0);

        h.link.process_data(room_envelope(1, "r-1"));
        h.link.process_data(subscription_envelope(2, "r-1"));
        h.link.process_data(subscription_envelope(3, "r-1"));

        assert_eq!(h.link.state(), LinkState::Sane);
        assert_eq!(h.link.last_message_id(), Some(3));
        assert_eq!(h.state.subscriber_count("r-1"), 2);
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sequence_gap_while_sane_evicts_self() {
        let mut h = harness();
        h.link.sync(0);

        h.link.process_data(room_envelope(1, "r-1"));
        h.link.process_data(room_envelope(3, "r-3"));

        assert_eq!(h.link.state(), LinkState::Evicted);
        match h.requests.try_recv().unwrap() {
            NodeRequest::EvictSelf { reason } => assert!(reason.contains("gap")),
            other => panic!("expected EvictSelf, got {:?}", other),
        }

        // Terminal: nothing further is processed
        h.link.process_data(room_envelope(4, "r-4"));
        assert!(h.state.room("r-4").is_none());
    }

    #[tokio::test]
    async fn test_missing_message_id_evicts_peer() {
        let mut h = harness();
        h.link.sync(0);

        let mut envelope = room_envelope(1, "r-1");
        envelope.message_id = None;
        h.link.process_data(envelope);

        assert_eq!(h.link.state(), LinkState::Evicted);
        match h.requests.try_recv().unwrap() {
            NodeRequest::EvictPeer {
                node_id,
                reason,
                broadcast,
            } => {
                assert_eq!(node_id, "remote");
                assert!(broadcast);
                assert!(reason.contains("missing messageId"));
            }
            other => panic!("expected EvictPeer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_evicts_peer() {
        let mut h = harness();
        h.link.sync(0);

        h.link.process_data(Envelope {
            topic: "room:renamed".to_string(),
            message_id: Some(1),
            payload: Vec::new(),
        });

        assert_eq!(h.link.state(), LinkState::Evicted);
        match h.requests.try_recv().unwrap() {
            NodeRequest::EvictPeer { reason, broadcast, .. } => {
                assert!(broadcast);
                assert!(reason.contains("room:renamed"));
            }
            other => panic!("expected EvictPeer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_evicts_self() {
        let mut h = harness();
        h.link.sync(0);

        // Subscription to a room this replica never saw
        h.link.process_data(subscription_envelope(1, "ghost"));

        assert_eq!(h.link.state(), LinkState::Evicted);
        assert!(matches!(
            h.requests.try_recv().unwrap(),
            NodeRequest::EvictSelf { .. }
        ));
    }

    #[tokio::test]
    async fn test_eviction_notice_for_local_node_means_self_eviction() {
        let mut h = harness();
        h.link.sync(0);

        let payload = NodeEvictedPayload {
            node_id: "local".to_string(),
            reason: "lease expired".to_string(),
        };
        h.link.process_data(Envelope {
            topic: topic::NODE_EVICTED.to_string(),
            message_id: Some(1),
            payload: encode_payload(&payload).unwrap(),
        });

        match h.requests.try_recv().unwrap() {
            NodeRequest::EvictSelf { reason } => {
                assert!(reason.contains("evicted by remote"));
            }
            other => panic!("expected EvictSelf, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eviction_notice_for_third_node_is_relayed_without_broadcast() {
        let mut h = harness();
        h.link.sync(0);

        let payload = NodeEvictedPayload {
            node_id: "third".to_string(),
            reason: "heartbeat timeout".to_string(),
        };
        h.link.process_data(Envelope {
            topic: topic::NODE_EVICTED.to_string(),
            message_id: Some(1),
            payload: encode_payload(&payload).unwrap(),
        });

        match h.requests.try_recv().unwrap() {
            NodeRequest::EvictPeer {
                node_id, broadcast, ..
            } => {
                assert_eq!(node_id, "third");
                assert!(!broadcast);
            }
            other => panic!("expected EvictPeer, got {:?}", other),
        }
        assert_eq!(h.link.state(), LinkState::Sane);
    }

    #[tokio::test]
    async fn test_cluster_event_is_reemitted_locally() {
        let mut h = harness();
        let mut events = h.events.subscribe_cluster();
        h.link.sync(0);

        let payload = ClusterEventPayload {
            event: "cache:flush".to_string(),
            payload: b"{}".to_vec(),
        };
        h.link.process_data(Envelope {
            topic: topic::CLUSTER_EVENT.to_string(),
            message_id: Some(1),
            payload: encode_payload(&payload).unwrap(),
        });

        let event = events.try_recv().unwrap();
        assert_eq!(event.origin, "remote");
        assert_eq!(event.event, "cache:flush");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_grace_then_eviction() {
        let mut h = harness();
        h.link.sync(0);

        // Within threshold: still sane
        advance(HEARTBEAT_DELAY).await;
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::Sane);

        // Past 1.5x the delay: one grace interval, not yet evicted
        advance(HEARTBEAT_DELAY).await;
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::MissingHeartbeat);
        assert!(h.requests.try_recv().is_err());

        // Second consecutive miss: evicted and broadcast
        advance(HEARTBEAT_DELAY).await;
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::Evicted);
        match h.requests.try_recv().unwrap() {
            NodeRequest::EvictPeer { reason, broadcast, .. } => {
                assert!(broadcast);
                assert!(reason.contains("heartbeat timeout"));
            }
            other => panic!("expected EvictPeer, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_recovers_when_traffic_resumes() {
        let h = harness();
        h.link.sync(0);

        advance(HEARTBEAT_DELAY * 2).await;
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::MissingHeartbeat);

        // Any message counts as proof of life, not only heartbeats
        h.link.process_data(room_envelope(1, "r-1"));
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::Sane);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_traffic_is_not_proof_of_life() {
        let mut h = harness();

        // Messages keep arriving but the join snapshot never does; queued
        // traffic is not validated, so it does not refresh the heartbeat
        // and the half-broken peer is eventually evicted
        h.link.on_envelope(room_envelope(1, "r-1"));
        advance(HEARTBEAT_DELAY * 2).await;
        h.link.on_envelope(room_envelope(2, "r-2"));
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::MissingHeartbeat);

        advance(HEARTBEAT_DELAY).await;
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::Evicted);
        assert!(matches!(
            h.requests.try_recv().unwrap(),
            NodeRequest::EvictPeer { broadcast: true, .. }
        ));
        assert_eq!(h.state.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_completes_the_join_from_missing_heartbeat() {
        let h = harness();

        advance(HEARTBEAT_DELAY * 2).await;
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::MissingHeartbeat);

        let snapshot = NodeSnapshot {
            version: SYNC_PROTOCOL_VERSION,
            rooms: Vec::new(),
            strategies: Vec::new(),
            indexes: Vec::new(),
        };
        h.link.on_envelope(Envelope {
            topic: topic::SNAPSHOT.to_string(),
            message_id: Some(0),
            payload: encode_payload(&snapshot).unwrap(),
        });

        assert_eq!(h.link.state(), LinkState::Sane);
        h.link.check_heartbeat();
        assert_eq!(h.link.state(), LinkState::Sane);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_terminal() {
        let mut h = harness();
        h.link.sync(0);

        h.link.dispose();
        h.link.dispose();

        assert_eq!(h.link.state(), LinkState::Evicted);
        assert!(h.requests.try_recv().is_err());

        h.link.process_data(room_envelope(1, "r-1"));
        assert_eq!(h.state.room_count(), 0);
    }
}
