//! Sync Publisher
//!
//! The outbound half of the replication transport: a TCP listener at the
//! sync port that pushes framed envelopes to every subscribed peer.
//!
//! Sequence assignment, subscriber admission, and local state capture all
//! serialize through one lock, which is what makes the join snapshot a true
//! baseline: a subscriber admitted at message N has seen, in its snapshot,
//! every local mutation up to and including N, and will receive N+1 onward
//! on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::protocol::{encode_payload, frame_envelope, topic, Envelope};
use crate::state::FullState;

struct PublisherInner {
    /// Last assigned sequence number; 0 before anything was published
    last_message_id: u64,
    /// Frame sinks of live subscriber connections
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Outbound sync channel of the local node
pub struct SyncPublisher {
    node_id: String,
    full_state: Arc<FullState>,
    metrics: Arc<Metrics>,
    inner: Mutex<PublisherInner>,
}

impl SyncPublisher {
    pub fn new(node_id: String, full_state: Arc<FullState>, metrics: Arc<Metrics>) -> Self {
        Self {
            node_id,
            full_state,
            metrics,
            inner: Mutex::new(PublisherInner {
                last_message_id: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Bind the sync listener and start accepting subscribers
    ///
    /// Returns the bound address, which differs from `addr` when an
    /// ephemeral port was requested.
    pub async fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Sync publisher '{}' listening on {}", self.node_id, local_addr);

        let publisher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Sync subscriber connected from {}", peer);
                            publisher.admit(stream);
                        }
                        Err(e) => {
                            error!("Failed to accept sync subscriber: {}", e);
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            }
        });

        Ok(local_addr)
    }

    /// Admit one subscriber: push its join snapshot, then add it to the
    /// broadcast set
    fn admit(&self, stream: TcpStream) {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(writer_loop(stream, rx));

        let mut inner = self.inner.lock();
        let snapshot = self.full_state.snapshot_for(&self.node_id);
        let envelope = Envelope {
            topic: topic::SNAPSHOT.to_string(),
            message_id: Some(inner.last_message_id),
            payload: match encode_payload(&snapshot) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode join snapshot: {}", e);
                    return;
                }
            },
        };
        match frame_envelope(&envelope) {
            Ok(frame) => {
                if tx.send(frame).is_ok() {
                    inner.subscribers.push(tx);
                    self.metrics.snapshots_sent_total.inc();
                }
            }
            Err(e) => error!("Failed to frame join snapshot: {}", e),
        }
    }

    /// Publish one sequenced message to every subscriber
    pub fn publish(&self, topic_name: &str, payload: Vec<u8>) -> u64 {
        self.publish_applied(topic_name, payload, |_| {})
    }

    /// Publish one sequenced message, applying a local mutation under the
    /// same lock that assigns its sequence number
    ///
    /// Local full-state writes go through here so a concurrently admitted
    /// subscriber can never observe a snapshot that disagrees with its
    /// sequence baseline.
    pub fn publish_applied<F>(&self, topic_name: &str, payload: Vec<u8>, apply: F) -> u64
    where
        F: FnOnce(u64),
    {
        let mut inner = self.inner.lock();
        inner.last_message_id += 1;
        let message_id = inner.last_message_id;

        apply(message_id);

        let envelope = Envelope {
            topic: topic_name.to_string(),
            message_id: Some(message_id),
            payload,
        };
        match frame_envelope(&envelope) {
            Ok(frame) => {
                inner
                    .subscribers
                    .retain(|tx| tx.send(frame.clone()).is_ok());
                self.metrics.messages_published_total.inc();
            }
            Err(e) => error!("Failed to frame '{}' message: {}", topic_name, e),
        }

        message_id
    }

    /// Last assigned sequence number
    pub fn last_message_id(&self) -> u64 {
        self.inner.lock().last_message_id
    }

    /// Live subscriber connections
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

async fn writer_loop(mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            debug!("Sync subscriber write failed, dropping connection: {}", e);
            return;
        }
    }
}
