//! Node Liveness Monitor
//!
//! Proves to the rest of the cluster that this node is alive by renewing a
//! TTL-backed lease in the shared store. The monitor runs as an isolated
//! task with its own store connection so that renewal timing is never skewed
//! by load on the node's main execution path.
//!
//! Every failure here is fatal to cluster membership: a node that cannot
//! prove liveness in time must stop acting as a cluster member rather than
//! keep appearing routable to peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::lease::{LeaseError, LeaseStore};

/// TTL multiplier: tolerates a couple of missed renewal cycles without
/// false eviction while keeping the worst-case staleness window bounded
const TTL_MULTIPLIER: u32 = 3;

/// Upward signal from the monitor; the only message it ever sends
#[derive(Debug, Clone)]
pub enum LivenessEvent {
    /// The node failed to prove liveness and must leave the cluster
    Fatal(String),
}

/// Liveness monitor configuration
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Lease key owned by this node
    pub lease_key: String,
    /// Renewal period; the lease TTL is three times this
    pub refresh_delay: Duration,
}

struct MonitorInner {
    lease_key: String,
    refresh_delay: Duration,
    store: Arc<dyn LeaseStore>,
    events: mpsc::UnboundedSender<LivenessEvent>,
    /// Set once, by whichever of dispose() or a fatal renewal comes first
    disposed: AtomicBool,
    /// Guards the best-effort lease deletion so it runs at most once
    lease_cleared: AtomicBool,
    shutdown: Notify,
}

impl MonitorInner {
    /// Report fatal upward exactly once
    fn fatal(&self, reason: String) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            warn!("Liveness monitor fatal: {}", reason);
            let _ = self.events.send(LivenessEvent::Fatal(reason));
        }
    }

    /// Best-effort lease deletion; failure is logged, never escalated
    async fn clear_lease(&self) {
        if self.lease_cleared.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.del(&self.lease_key).await {
            warn!("Failed to delete lease key '{}': {}", self.lease_key, e);
        }
    }
}

/// Renews this node's lease on a fixed period and reports fatal upward when
/// a renewal is missed or fails
pub struct NodeLivenessMonitor {
    inner: Arc<MonitorInner>,
}

impl NodeLivenessMonitor {
    /// Establish the lease and start the renewal task
    ///
    /// The first renewal happens here, before any timer is armed; waiting a
    /// full period for it would risk peers never seeing the lease at all.
    /// An error establishing it is returned to the caller and nothing is
    /// scheduled.
    pub async fn start(
        store: Arc<dyn LeaseStore>,
        config: LivenessConfig,
        events: mpsc::UnboundedSender<LivenessEvent>,
    ) -> Result<Self, LeaseError> {
        let ttl_ms = ttl_millis(config.refresh_delay);
        store.set_lease(&config.lease_key, ttl_ms).await?;
        debug!(
            "Lease '{}' established (ttl={}ms, refresh={:?})",
            config.lease_key, ttl_ms, config.refresh_delay
        );

        let inner = Arc::new(MonitorInner {
            lease_key: config.lease_key,
            refresh_delay: config.refresh_delay,
            store,
            events,
            disposed: AtomicBool::new(false),
            lease_cleared: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let task_inner = inner.clone();
        tokio::spawn(async move {
            Self::renewal_loop(task_inner).await;
        });

        Ok(Self { inner })
    }

    async fn renewal_loop(inner: Arc<MonitorInner>) {
        let ttl_ms = ttl_millis(inner.refresh_delay);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.refresh_delay) => {}
                _ = inner.shutdown.notified() => return,
            }
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }

            let renewed = inner.store.pexpire(&inner.lease_key, ttl_ms).await;

            // dispose() may have won the race during the store roundtrip
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }

            match renewed {
                Ok(true) => {}
                Ok(false) => {
                    inner.fatal(format!(
                        "lease '{}' expired before renewal, this node is too slow to be trusted",
                        inner.lease_key
                    ));
                    inner.clear_lease().await;
                    return;
                }
                Err(e) => {
                    inner.fatal(format!(
                        "lease '{}' renewal failed: {}",
                        inner.lease_key, e
                    ));
                    inner.clear_lease().await;
                    return;
                }
            }
        }
    }

    /// Whether the monitor has stopped, by disposal or by a fatal renewal
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop renewing and delete the lease, best-effort
    ///
    /// Idempotent, and safe to call concurrently with an in-flight renewal:
    /// the renewal checks the disposed flag after its store roundtrip and
    /// no-ops instead of acting on a stale result.
    pub async fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            info!("Liveness monitor for '{}' disposed", self.inner.lease_key);
        }
        self.inner.shutdown.notify_waiters();
        self.inner.clear_lease().await;
    }
}

fn ttl_millis(refresh_delay: Duration) -> u64 {
    (refresh_delay * TTL_MULTIPLIER).as_millis() as u64
}
