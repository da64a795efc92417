//! Configuration Module
//!
//! TOML-based configuration for a statemesh node:
//! - Node identity and heartbeat cadence
//! - Sync endpoint (bind and advertise addresses)
//! - Gossip membership (bind/advertise, seeds, intervals)
//! - Liveness lease store
//! - Environment variable overrides (STATEMESH_* prefix)

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::Deserialize;

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity and heartbeat cadence
    pub node: NodeConfig,
    /// Sync endpoint configuration
    pub sync: SyncConfig,
    /// Gossip membership configuration
    pub gossip: GossipConfig,
    /// Liveness lease configuration
    pub lease: LeaseConfig,
}

impl Config {
    /// Load configuration from a TOML file with STATEMESH_* env overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .add_source(Environment::with_prefix("STATEMESH").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.heartbeat_delay.is_zero() {
            return Err(ConfigError::Validation(
                "node.heartbeat_delay must be greater than zero".to_string(),
            ));
        }
        if self.lease.refresh_delay.is_zero() {
            return Err(ConfigError::Validation(
                "lease.refresh_delay must be greater than zero".to_string(),
            ));
        }
        if self.lease.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "lease.key_prefix must not be empty".to_string(),
            ));
        }
        if self.gossip.interval.is_zero() {
            return Err(ConfigError::Validation(
                "gossip.interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Node identity and heartbeat cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier (auto-generated from hostname if not set)
    pub id: Option<String>,

    /// Interval between explicit heartbeats on the sync channel; links
    /// consider a peer stale after 1.5x this without traffic
    #[serde(with = "humantime_serde")]
    pub heartbeat_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            heartbeat_delay: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    /// Get the node ID, generating from hostname if not set
    pub fn get_node_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| format!("{}-{}", h.to_string_lossy(), rand_id()))
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }
}

/// Sync endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Address the sync publisher binds to
    /// Default: 0.0.0.0:7917
    pub bind_addr: SocketAddr,

    /// Advertise address for the sync endpoint (what peers connect to)
    /// If not set, resolved from hostname or falls back to bind_addr
    pub advertise_addr: Option<SocketAddr>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7917".parse().unwrap(),
            advertise_addr: None,
        }
    }
}

impl SyncConfig {
    /// Get the sync advertise address (what peers connect to)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn advertise_addr(&self) -> SocketAddr {
        resolve_advertise(self.advertise_addr, self.bind_addr)
    }
}

/// Gossip membership configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Address the gossip layer binds to
    /// Default: 0.0.0.0:7916
    pub bind_addr: SocketAddr,

    /// Advertise address for gossip (what peers use to reach us)
    /// If not set, resolved from hostname or falls back to bind_addr
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes for cluster discovery, "host:port" (gossip port)
    pub seeds: Vec<String>,

    /// Cluster name; nodes with different names never mesh
    pub cluster_id: String,

    /// Gossip interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Grace period before a dead node is purged from the gossip view
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7916".parse().unwrap(),
            advertise_addr: None,
            seeds: Vec::new(),
            cluster_id: "statemesh".to_string(),
            interval: Duration::from_secs(1),
            dead_node_grace_period: Duration::from_secs(30),
        }
    }
}

impl GossipConfig {
    /// Get the gossip advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn advertise_addr(&self) -> SocketAddr {
        resolve_advertise(self.advertise_addr, self.bind_addr)
    }
}

/// Liveness lease configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease store address, host:port
    pub addr: String,

    /// Prefix of per-node lease keys
    pub key_prefix: String,

    /// Lease renewal period; the lease TTL is three times this
    #[serde(with = "humantime_serde")]
    pub refresh_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            key_prefix: "statemesh/node".to_string(),
            refresh_delay: Duration::from_secs(2),
        }
    }
}

impl LeaseConfig {
    /// Lease key owned by one node
    pub fn lease_key(&self, node_id: &str) -> String {
        format!("{}/{}", self.key_prefix, node_id)
    }
}

fn resolve_advertise(explicit: Option<SocketAddr>, bind: SocketAddr) -> SocketAddr {
    if let Some(addr) = explicit {
        return addr;
    }

    // Try to resolve our hostname to get the real IP
    if let Some(ip) = resolve_local_ip() {
        return SocketAddr::new(ip, bind.port());
    }

    bind
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let hostname_str = hostname.to_string_lossy();

    let addr_str = format!("{}:0", hostname_str);
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4()) // Prefer IPv4
        .map(|addr| addr.ip())
}

/// Generate a random suffix for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}
