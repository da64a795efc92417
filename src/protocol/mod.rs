//! Sync Protocol
//!
//! Defines the binary protocol used for inter-node state replication.
//! Every message travels as a length-prefixed [`Envelope`] naming its topic;
//! payloads are topic-specific bincode structures.

use std::fmt;

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt};

mod payload;
pub mod topic;

pub use payload::{
    AuthStrategyAdded, AuthStrategyRemoved, ClusterEventPayload, CollectionAdded,
    CollectionRemoved, DocumentNotificationPayload, IndexAdded, IndexScope, IndexSnapshot,
    IndexesRemoved, NodeEvictedPayload, NodeShutdownPayload, NodeSnapshot, ProfileInvalidated,
    RoleInvalidated, RoomCreated, RoomRemoved, RoomSnapshot, SubscriptionChanged,
    UserNotificationPayload,
};

/// Protocol version for compatibility checking, carried in the join snapshot
pub const SYNC_PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame; a join snapshot for a large cluster
/// dominates all other message sizes
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol error types
#[derive(Debug)]
pub enum ProtocolError {
    /// Encoding a message failed
    Encode(String),
    /// Decoding a message failed
    Decode(String),
    /// Frame length prefix exceeds the allowed maximum
    FrameTooLarge(usize),
    /// IO error on the sync stream
    Io(std::io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "encode error: {}", e),
            ProtocolError::Decode(e) => write!(f, "decode error: {}", e),
            ProtocolError::FrameTooLarge(len) => write!(f, "frame of {} bytes too large", len),
            ProtocolError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

/// Message envelope exchanged between cluster nodes
///
/// `message_id` is assigned by the sender and is strictly increasing per
/// outbound channel. It is optional on the wire so that a sender omitting it
/// can be detected and evicted rather than silently defaulted.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Envelope {
    /// Topic name, keys the payload schema and the handler
    pub topic: String,
    /// Sender-assigned sequence number
    pub message_id: Option<u64>,
    /// Topic-specific bincode payload
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encode the envelope to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode an envelope from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::decode_from_slice(data, bincode::config::standard())
            .map(|(env, _)| env)
            .map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Encode a topic payload using bincode
pub fn encode_payload<T: Encode>(payload: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::encode_to_vec(payload, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a topic payload using bincode
pub fn decode_payload<T: Decode<()>>(data: &[u8]) -> Result<T, ProtocolError> {
    bincode::decode_from_slice(data, bincode::config::standard())
        .map(|(payload, _)| payload)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Frame an envelope with a length prefix for TCP transmission
pub fn frame_envelope(env: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = env.encode()?;
    let len = body.len() as u32;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);

    Ok(frame)
}

/// Read one framed envelope from the sync stream
pub async fn read_envelope<R>(stream: &mut R) -> Result<Envelope, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Envelope::decode(&body)
}

/// Handler identity for one sync topic
///
/// The lookup table is the single dispatch point for inbound messages; an
/// unknown topic name is a protocol violation handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Heartbeat,
    Snapshot,
    RoomCreated,
    RoomRemoved,
    SubscriptionAdded,
    SubscriptionRemoved,
    ClusterEvent,
    DocumentNotification,
    UserNotification,
    AuthStrategyAdded,
    AuthStrategyRemoved,
    IndexAdded,
    IndexesRemoved,
    CollectionAdded,
    CollectionRemoved,
    ProfileInvalidated,
    RoleInvalidated,
    ValidatorsRefreshed,
    NodeEvicted,
    NodeShutdown,
}

impl TopicKind {
    /// Resolve a wire topic name to its handler identity
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            topic::HEARTBEAT => Some(TopicKind::Heartbeat),
            topic::SNAPSHOT => Some(TopicKind::Snapshot),
            topic::ROOM_CREATED => Some(TopicKind::RoomCreated),
            topic::ROOM_REMOVED => Some(TopicKind::RoomRemoved),
            topic::SUBSCRIPTION_ADDED => Some(TopicKind::SubscriptionAdded),
            topic::SUBSCRIPTION_REMOVED => Some(TopicKind::SubscriptionRemoved),
            topic::CLUSTER_EVENT => Some(TopicKind::ClusterEvent),
            topic::DOCUMENT_NOTIFICATION => Some(TopicKind::DocumentNotification),
            topic::USER_NOTIFICATION => Some(TopicKind::UserNotification),
            topic::AUTH_STRATEGY_ADDED => Some(TopicKind::AuthStrategyAdded),
            topic::AUTH_STRATEGY_REMOVED => Some(TopicKind::AuthStrategyRemoved),
            topic::INDEX_ADDED => Some(TopicKind::IndexAdded),
            topic::INDEXES_REMOVED => Some(TopicKind::IndexesRemoved),
            topic::COLLECTION_ADDED => Some(TopicKind::CollectionAdded),
            topic::COLLECTION_REMOVED => Some(TopicKind::CollectionRemoved),
            topic::PROFILE_INVALIDATED => Some(TopicKind::ProfileInvalidated),
            topic::ROLE_INVALIDATED => Some(TopicKind::RoleInvalidated),
            topic::VALIDATORS_REFRESHED => Some(TopicKind::ValidatorsRefreshed),
            topic::NODE_EVICTED => Some(TopicKind::NodeEvicted),
            topic::NODE_SHUTDOWN => Some(TopicKind::NodeShutdown),
            _ => None,
        }
    }

    /// Get the wire topic name
    pub fn name(self) -> &'static str {
        match self {
            TopicKind::Heartbeat => topic::HEARTBEAT,
            TopicKind::Snapshot => topic::SNAPSHOT,
            TopicKind::RoomCreated => topic::ROOM_CREATED,
            TopicKind::RoomRemoved => topic::ROOM_REMOVED,
            TopicKind::SubscriptionAdded => topic::SUBSCRIPTION_ADDED,
            TopicKind::SubscriptionRemoved => topic::SUBSCRIPTION_REMOVED,
            TopicKind::ClusterEvent => topic::CLUSTER_EVENT,
            TopicKind::DocumentNotification => topic::DOCUMENT_NOTIFICATION,
            TopicKind::UserNotification => topic::USER_NOTIFICATION,
            TopicKind::AuthStrategyAdded => topic::AUTH_STRATEGY_ADDED,
            TopicKind::AuthStrategyRemoved => topic::AUTH_STRATEGY_REMOVED,
            TopicKind::IndexAdded => topic::INDEX_ADDED,
            TopicKind::IndexesRemoved => topic::INDEXES_REMOVED,
            TopicKind::CollectionAdded => topic::COLLECTION_ADDED,
            TopicKind::CollectionRemoved => topic::COLLECTION_REMOVED,
            TopicKind::ProfileInvalidated => topic::PROFILE_INVALIDATED,
            TopicKind::RoleInvalidated => topic::ROLE_INVALIDATED,
            TopicKind::ValidatorsRefreshed => topic::VALIDATORS_REFRESHED,
            TopicKind::NodeEvicted => topic::NODE_EVICTED,
            TopicKind::NodeShutdown => topic::NODE_SHUTDOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_frame_envelope() {
        let env = Envelope {
            topic: topic::HEARTBEAT.to_string(),
            message_id: Some(42),
            payload: Vec::new(),
        };
        let frame = frame_envelope(&env).unwrap();

        // First 4 bytes are the length prefix
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - 4);

        let decoded = Envelope::decode(&frame[4..]).unwrap();
        assert_eq!(decoded.topic, topic::HEARTBEAT);
        assert_eq!(decoded.message_id, Some(42));
    }

    #[test]
    fn test_missing_message_id_survives_roundtrip() {
        let env = Envelope {
            topic: topic::ROOM_CREATED.to_string(),
            message_id: None,
            payload: vec![1, 2, 3],
        };
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_id, None);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_typed_payload_roundtrip() {
        let room = RoomCreated {
            room_id: "r-1".to_string(),
            index: "library".to_string(),
            collection: "books".to_string(),
            filter: "{\"exists\":\"title\"}".to_string(),
        };
        let bytes = encode_payload(&room).unwrap();
        let decoded: RoomCreated = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.room_id, "r-1");
        assert_eq!(decoded.collection, "books");
    }

    #[test_case(topic::HEARTBEAT, Some(TopicKind::Heartbeat))]
    #[test_case(topic::ROOM_CREATED, Some(TopicKind::RoomCreated))]
    #[test_case(topic::NODE_EVICTED, Some(TopicKind::NodeEvicted))]
    #[test_case("room:renamed", None)]
    #[test_case("", None)]
    fn test_topic_lookup(name: &str, expected: Option<TopicKind>) {
        assert_eq!(TopicKind::lookup(name), expected);
    }

    #[test]
    fn test_every_kind_roundtrips_through_lookup() {
        let kinds = [
            TopicKind::Heartbeat,
            TopicKind::Snapshot,
            TopicKind::RoomCreated,
            TopicKind::RoomRemoved,
            TopicKind::SubscriptionAdded,
            TopicKind::SubscriptionRemoved,
            TopicKind::ClusterEvent,
            TopicKind::DocumentNotification,
            TopicKind::UserNotification,
            TopicKind::AuthStrategyAdded,
            TopicKind::AuthStrategyRemoved,
            TopicKind::IndexAdded,
            TopicKind::IndexesRemoved,
            TopicKind::CollectionAdded,
            TopicKind::CollectionRemoved,
            TopicKind::ProfileInvalidated,
            TopicKind::RoleInvalidated,
            TopicKind::ValidatorsRefreshed,
            TopicKind::NodeEvicted,
            TopicKind::NodeShutdown,
        ];
        for kind in kinds {
            assert_eq!(TopicKind::lookup(kind.name()), Some(kind));
        }
    }

    #[tokio::test]
    async fn test_read_envelope_rejects_oversized_frame() {
        let mut oversized = Vec::new();
        oversized.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(oversized);
        let err = read_envelope(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }
}
