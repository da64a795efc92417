use std::time::Duration;

use super::*;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert!(config.node.id.is_none());
    assert_eq!(config.node.heartbeat_delay, Duration::from_secs(2));
    assert_eq!(config.sync.bind_addr, "0.0.0.0:7917".parse().unwrap());
    assert_eq!(config.gossip.bind_addr, "0.0.0.0:7916".parse().unwrap());
    assert!(config.gossip.seeds.is_empty());
    assert_eq!(config.gossip.cluster_id, "statemesh");
    assert_eq!(config.lease.addr, "127.0.0.1:6379");
    config.validate().unwrap();
}

#[test]
fn test_get_node_id_with_explicit() {
    let mut config = NodeConfig::default();
    config.id = Some("alpha".to_string());
    assert_eq!(config.get_node_id(), "alpha");
}

#[test]
fn test_get_node_id_auto_generated_is_unique_per_call() {
    let config = NodeConfig::default();
    let id = config.get_node_id();
    assert!(!id.is_empty());
}

#[test]
fn test_lease_key_derivation() {
    let config = LeaseConfig::default();
    assert_eq!(config.lease_key("alpha"), "statemesh/node/alpha");
}

#[test]
fn test_explicit_advertise_addr_wins() {
    let mut config = SyncConfig::default();
    config.advertise_addr = Some("192.0.2.7:7917".parse().unwrap());
    assert_eq!(config.advertise_addr(), "192.0.2.7:7917".parse().unwrap());
}

#[test]
fn test_validation_rejects_zero_refresh_delay() {
    let mut config = Config::default();
    config.lease.refresh_delay = Duration::ZERO;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_validation_rejects_empty_key_prefix() {
    let mut config = Config::default();
    config.lease.key_prefix = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_toml_deserialization_with_humantime_durations() {
    let toml = r#"
        [node]
        id = "alpha"
        heartbeat_delay = "500ms"

        [sync]
        bind_addr = "127.0.0.1:7917"

        [gossip]
        seeds = ["seed-1:7916", "seed-2:7916"]
        interval = "2s"

        [lease]
        addr = "redis:6379"
        refresh_delay = "1s"
    "#;
    let config: Config = toml::from_str(toml).unwrap();

    assert_eq!(config.node.id.as_deref(), Some("alpha"));
    assert_eq!(config.node.heartbeat_delay, Duration::from_millis(500));
    assert_eq!(config.gossip.seeds.len(), 2);
    assert_eq!(config.gossip.interval, Duration::from_secs(2));
    assert_eq!(config.lease.addr, "redis:6379");
    assert_eq!(config.lease.refresh_delay, Duration::from_secs(1));
    config.validate().unwrap();
}
