//! Statemesh - Cluster state replication engine
//!
//! An eventually-consistent, gossip-discovered replication layer for
//! multi-node realtime backends: TTL-lease liveness, strictly-ordered
//! per-link state sync, and heartbeat-driven failure detection with
//! peer and self eviction.

pub mod config;
pub mod events;
pub mod lease;
pub mod liveness;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod state;

pub use config::Config;
pub use events::{NodeEvents, Notification, RemoteEvent, SecuritySignal};
pub use lease::{LeaseError, LeaseStore, MemoryLeaseStore, RespLeaseStore};
pub use liveness::{LivenessConfig, LivenessEvent, NodeLivenessMonitor};
pub use metrics::Metrics;
pub use node::{ClusterLink, ClusterNode, LinkState, NodeError, NodeRequest, SyncPublisher};
pub use protocol::{Envelope, TopicKind, SYNC_PROTOCOL_VERSION};
pub use state::FullState;
