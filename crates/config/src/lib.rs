//! Configuration schema and loader for spindle nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's name, unique within the domain.
    pub node_name: String,

    /// Routing domain this node belongs to.
    #[serde(default = "default_domain")]
    pub domain_name: String,

    /// Areas this node participates in.
    #[serde(default = "default_areas")]
    pub areas: BTreeSet<String>,

    /// Whether IPv4 transport addresses are exchanged and required.
    #[serde(default)]
    pub enable_v4: bool,

    /// Reject hellos whose v4 address is outside the local subnet.
    #[serde(default = "default_true")]
    pub enable_subnet_validation: bool,

    /// Run the hello/handshake/heartbeat state machine (vs. legacy hellos).
    #[serde(default = "default_true")]
    pub enable_spark2: bool,

    /// Participate in spanning-tree optimized flooding.
    #[serde(default)]
    pub enable_flood_optimization: bool,

    /// Whether this node offers itself as a flooding root.
    #[serde(default)]
    pub is_flood_root: bool,

    /// Neighbor discovery settings.
    #[serde(default)]
    pub spark: SparkSection,

    /// Key-value store settings.
    #[serde(default)]
    pub kvstore: KvStoreSection,

    /// MPLS label range for per-adjacency local labels, inclusive.
    #[serde(default = "default_sr_local_range")]
    pub sr_local_range: (u32, u32),

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkSection {
    /// UDP port of the discovery multicast socket.
    #[serde(default = "default_udp_mcast_port")]
    pub udp_mcast_port: u16,

    /// Graceful-restart hold time advertised to neighbors, ms.
    #[serde(default = "default_hold_time_ms")]
    pub hold_time_ms: u64,

    /// Steady-state hello period, ms.
    #[serde(default = "default_keep_alive_time_ms")]
    pub keep_alive_time_ms: u64,

    /// Elevated hello period during fast-init, ms.
    #[serde(default = "default_fast_init_keep_alive_time_ms")]
    pub fast_init_keep_alive_time_ms: u64,

    /// Period between handshake retransmits in NEGOTIATE, ms.
    #[serde(default = "default_handshake_time_ms")]
    pub handshake_time_ms: u64,

    /// How long to wait in NEGOTIATE before falling back to WARM, ms.
    #[serde(default = "default_negotiate_hold_time_ms")]
    pub negotiate_hold_time_ms: u64,

    /// Heartbeat hold time advertised to neighbors, ms.
    #[serde(default = "default_heartbeat_hold_time_ms")]
    pub heartbeat_hold_time_ms: u64,

    /// Per-(interface, source) inbound rate cap, packets per second.
    #[serde(default = "default_max_allowed_pps")]
    pub max_allowed_pps: u32,
}

impl Default for SparkSection {
    fn default() -> Self {
        Self {
            udp_mcast_port: default_udp_mcast_port(),
            hold_time_ms: default_hold_time_ms(),
            keep_alive_time_ms: default_keep_alive_time_ms(),
            fast_init_keep_alive_time_ms: default_fast_init_keep_alive_time_ms(),
            handshake_time_ms: default_handshake_time_ms(),
            negotiate_hold_time_ms: default_negotiate_hold_time_ms(),
            heartbeat_hold_time_ms: default_heartbeat_hold_time_ms(),
            max_allowed_pps: default_max_allowed_pps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreSection {
    /// TCP port of the store's command endpoint.
    #[serde(default = "default_kv_cmd_port")]
    pub cmd_port: u16,

    /// TCP port of the store's publication endpoint.
    #[serde(default = "default_kv_pub_port")]
    pub pub_port: u16,

    /// Period of the full-sync timer with peers, seconds.
    #[serde(default = "default_db_sync_interval_secs")]
    pub db_sync_interval_secs: u64,

    /// TTL subtracted from every record on each flood hop, ms.
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: u64,

    /// Period of the TTL reaper, ms.
    #[serde(default = "default_ttl_reaper_interval_ms")]
    pub ttl_reaper_interval_ms: u64,

    /// Sentinel TTL meaning "never expires". Must match the protocol-wide
    /// sentinel for records to interoperate.
    #[serde(default = "default_ttl_infinity_ms")]
    pub ttl_infinity_ms: i64,

    /// Outbound flood rate cap; `None` disables rate control.
    #[serde(default)]
    pub flood_rate: Option<FloodRate>,
}

impl Default for KvStoreSection {
    fn default() -> Self {
        Self {
            cmd_port: default_kv_cmd_port(),
            pub_port: default_kv_pub_port(),
            db_sync_interval_secs: default_db_sync_interval_secs(),
            ttl_decrement_ms: default_ttl_decrement_ms(),
            ttl_reaper_interval_ms: default_ttl_reaper_interval_ms(),
            ttl_infinity_ms: default_ttl_infinity_ms(),
            flood_rate: None,
        }
    }
}

/// Token-bucket parameters for outbound flood publications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloodRate {
    pub burst_size: u32,
    pub msgs_per_sec: u32,
}

// --- Defaults ---

fn default_domain() -> String {
    "default".to_string()
}
fn default_areas() -> BTreeSet<String> {
    [spindle_common::DEFAULT_AREA.to_string()].into()
}
fn default_true() -> bool {
    true
}
fn default_udp_mcast_port() -> u16 {
    6666
}
fn default_hold_time_ms() -> u64 {
    30_000
}
fn default_keep_alive_time_ms() -> u64 {
    2_000
}
fn default_fast_init_keep_alive_time_ms() -> u64 {
    100
}
fn default_handshake_time_ms() -> u64 {
    500
}
fn default_negotiate_hold_time_ms() -> u64 {
    10_000
}
fn default_heartbeat_hold_time_ms() -> u64 {
    6_000
}
fn default_max_allowed_pps() -> u32 {
    300
}
fn default_kv_cmd_port() -> u16 {
    60_002
}
fn default_kv_pub_port() -> u16 {
    60_001
}
fn default_db_sync_interval_secs() -> u64 {
    60
}
fn default_ttl_decrement_ms() -> u64 {
    1
}
fn default_ttl_reaper_interval_ms() -> u64 {
    1_000
}
fn default_ttl_infinity_ms() -> i64 {
    spindle_common::TTL_INFINITY
}
fn default_sr_local_range() -> (u32, u32) {
    (50_000, 59_999)
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::Invalid("node_name must not be empty".into()));
        }
        if self.domain_name.is_empty() {
            return Err(ConfigError::Invalid("domain_name must not be empty".into()));
        }
        if self.areas.is_empty() {
            return Err(ConfigError::Invalid("areas must not be empty".into()));
        }
        if self.spark.keep_alive_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "spark.keep_alive_time_ms must be > 0".into(),
            ));
        }
        if self.spark.hold_time_ms < 3 * self.spark.keep_alive_time_ms {
            return Err(ConfigError::Invalid(format!(
                "spark.hold_time_ms ({}) must be >= 3 * keep_alive_time_ms ({})",
                self.spark.hold_time_ms, self.spark.keep_alive_time_ms
            )));
        }
        if self.spark.fast_init_keep_alive_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "spark.fast_init_keep_alive_time_ms must be > 0".into(),
            ));
        }
        if self.spark.fast_init_keep_alive_time_ms > self.spark.keep_alive_time_ms {
            return Err(ConfigError::Invalid(format!(
                "spark.fast_init_keep_alive_time_ms ({}) must be <= keep_alive_time_ms ({})",
                self.spark.fast_init_keep_alive_time_ms, self.spark.keep_alive_time_ms
            )));
        }
        if self.sr_local_range.0 >= self.sr_local_range.1 {
            return Err(ConfigError::Invalid(format!(
                "sr_local_range lo ({}) must be < hi ({})",
                self.sr_local_range.0, self.sr_local_range.1
            )));
        }
        if let Some(rate) = self.kvstore.flood_rate {
            if rate.burst_size == 0 || rate.msgs_per_sec == 0 {
                return Err(ConfigError::Invalid(
                    "kvstore.flood_rate burst_size and msgs_per_sec must be > 0".into(),
                ));
            }
        }
        if self.kvstore.ttl_infinity_ms != spindle_common::TTL_INFINITY {
            return Err(ConfigError::Invalid(format!(
                "kvstore.ttl_infinity_ms ({}) must be the protocol sentinel ({})",
                self.kvstore.ttl_infinity_ms,
                spindle_common::TTL_INFINITY
            )));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
node_name: "thanos"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.node_name, "thanos");
        assert_eq!(config.domain_name, "default");
        assert_eq!(config.areas.len(), 1);
        assert!(config.areas.contains("0"));
        assert_eq!(config.spark.udp_mcast_port, 6666);
        assert_eq!(config.spark.keep_alive_time_ms, 2_000);
        assert!(config.enable_subnet_validation);
        assert!(config.enable_spark2);
        assert!(!config.enable_flood_optimization);
        assert!(config.kvstore.flood_rate.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
node_name: "thanos"
domain_name: "universe"
areas: ["0", "backbone"]
enable_v4: true
enable_flood_optimization: true
is_flood_root: true
spark:
  udp_mcast_port: 6667
  hold_time_ms: 60000
  keep_alive_time_ms: 5000
  fast_init_keep_alive_time_ms: 200
kvstore:
  cmd_port: 7002
  db_sync_interval_secs: 120
  flood_rate:
    burst_size: 200
    msgs_per_sec: 500
sr_local_range: [1024, 2048]
metrics_port: 9090
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.domain_name, "universe");
        assert_eq!(config.areas.len(), 2);
        assert!(config.enable_v4);
        assert!(config.is_flood_root);
        assert_eq!(config.spark.hold_time_ms, 60_000);
        assert_eq!(config.kvstore.cmd_port, 7002);
        assert_eq!(config.kvstore.flood_rate.unwrap().msgs_per_sec, 500);
        assert_eq!(config.sr_local_range, (1024, 2048));
        assert_eq!(config.metrics_port, Some(9090));
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = load_from_str("node_name: \"thanos\"\n").unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.node_name, config2.node_name);
        assert_eq!(config.spark.hold_time_ms, config2.spark.hold_time_ms);
    }

    #[test]
    fn test_rejects_empty_node_name() {
        let result = load_from_str("node_name: \"\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_hold_time_below_keep_alive() {
        let yaml = r#"
node_name: "thanos"
spark:
  hold_time_ms: 3000
  keep_alive_time_ms: 2000
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("hold_time_ms"), "got: {}", err);
    }

    #[test]
    fn test_rejects_fast_init_above_keep_alive() {
        let yaml = r#"
node_name: "thanos"
spark:
  keep_alive_time_ms: 1000
  hold_time_ms: 3000
  fast_init_keep_alive_time_ms: 2000
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("fast_init"), "got: {}", err);
    }

    #[test]
    fn test_rejects_empty_areas() {
        let yaml = r#"
node_name: "thanos"
areas: []
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("areas"), "got: {}", err);
    }

    #[test]
    fn test_rejects_inverted_label_range() {
        let yaml = r#"
node_name: "thanos"
sr_local_range: [100, 100]
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("sr_local_range"), "got: {}", err);
    }

    #[test]
    fn test_rejects_foreign_ttl_sentinel() {
        let yaml = r#"
node_name: "thanos"
kvstore:
  ttl_infinity_ms: -1
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("ttl_infinity_ms"), "got: {}", err);
    }

    #[test]
    fn test_rejects_zero_flood_rate() {
        let yaml = r#"
node_name: "thanos"
kvstore:
  flood_rate:
    burst_size: 0
    msgs_per_sec: 100
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("flood_rate"), "got: {}", err);
    }
}
