//! Prometheus metrics for the replication engine
//!
//! Collected into one registry so an embedding server can expose them
//! alongside its own.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// All replication metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Link metrics
    pub links_current: IntGauge,
    pub messages_applied_total: IntCounter,
    pub messages_buffered_total: IntCounter,
    pub heartbeat_misses_total: IntCounter,

    // Outbound metrics
    pub messages_published_total: IntCounter,
    pub snapshots_sent_total: IntCounter,

    // Eviction metrics
    pub peer_evictions_total: IntCounter,
    pub self_evictions_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let links_current = IntGauge::with_opts(Opts::new(
            "statemesh_links_current",
            "Cluster links currently held to remote nodes",
        ))
        .unwrap();

        let messages_applied_total = IntCounter::with_opts(Opts::new(
            "statemesh_messages_applied_total",
            "Sync messages validated and applied to the full state",
        ))
        .unwrap();

        let messages_buffered_total = IntCounter::with_opts(Opts::new(
            "statemesh_messages_buffered_total",
            "Sync messages queued while a link was buffering",
        ))
        .unwrap();

        let heartbeat_misses_total = IntCounter::with_opts(Opts::new(
            "statemesh_heartbeat_misses_total",
            "Heartbeat checks that found a link stale",
        ))
        .unwrap();

        let messages_published_total = IntCounter::with_opts(Opts::new(
            "statemesh_messages_published_total",
            "Sync messages published to the outbound channel",
        ))
        .unwrap();

        let snapshots_sent_total = IntCounter::with_opts(Opts::new(
            "statemesh_snapshots_sent_total",
            "Join snapshots pushed to newly accepted subscribers",
        ))
        .unwrap();

        let peer_evictions_total = IntCounter::with_opts(Opts::new(
            "statemesh_peer_evictions_total",
            "Remote nodes evicted by this node",
        ))
        .unwrap();

        let self_evictions_total = IntCounter::with_opts(Opts::new(
            "statemesh_self_evictions_total",
            "Times this node evicted itself over a correctness violation",
        ))
        .unwrap();

        registry.register(Box::new(links_current.clone())).unwrap();
        registry
            .register(Box::new(messages_applied_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_buffered_total.clone()))
            .unwrap();
        registry
            .register(Box::new(heartbeat_misses_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_published_total.clone()))
            .unwrap();
        registry
            .register(Box::new(snapshots_sent_total.clone()))
            .unwrap();
        registry
            .register(Box::new(peer_evictions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(self_evictions_total.clone()))
            .unwrap();

        Self {
            registry,
            links_current,
            messages_applied_total,
            messages_buffered_total,
            heartbeat_misses_total,
            messages_published_total,
            snapshots_sent_total,
            peer_evictions_total,
            self_evictions_total,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
