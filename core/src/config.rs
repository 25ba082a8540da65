//! Configuration options.
//!
//! A single TOML file configures flow-table timeouts, classification rules,
//! and the sink; the application loads it and chooses online or offline
//! capture via its own CLI before constructing an [`Orchestrator`](crate::orchestrator::Orchestrator).
//!
//! Grounded in `core/src/config.rs` (`load_config`, `default_config`, the
//! `online`/`offline`-is-mutually-exclusive check, per-field
//! `#[serde(default = "...")]` functions) trimmed of everything
//! DPDK-specific, since this engine has no hardware NIC layer.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {0:?}: {1}")]
    Read(String, std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("exactly one of [online] or [offline] must be set")]
    AmbiguousSource,
}

/// Loads a configuration file from `path`, checking that exactly one of
/// `online`/`offline` is present.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
    let config: RuntimeConfig = toml::from_str(&text)?;
    if config.online.is_some() == config.offline.is_some() {
        return Err(ConfigError::AmbiguousSource);
    }
    Ok(config)
}

/// For demonstration purposes: an offline configuration reading from a
/// bundled sample capture, recording every telemetry topic, with a 5
/// minute flow idle timeout.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/// Runtime configuration options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Flow-table and classification/telemetry settings. Always present.
    pub flow: FlowConfig,

    /// Sink settings. Always present.
    pub sink: SinkConfig,

    /// Live capture settings. Either `online` or `offline` must be set.
    #[serde(default = "default_online")]
    pub online: Option<OnlineConfig>,

    /// Offline (pcap file) capture settings. Either `online` or `offline`
    /// must be set.
    #[serde(default = "default_offline")]
    pub offline: Option<OfflineConfig>,

    /// Direction-inference settings.
    #[serde(default)]
    pub direction: DirectionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            flow: FlowConfig::default(),
            sink: SinkConfig {
                path: "./telemetry.jsonl".to_string(),
            },
            online: None,
            offline: Some(OfflineConfig {
                pcap: "./traces/small_flows.pcap".to_string(),
                max_packets: None,
            }),
            direction: DirectionConfig::default(),
        }
    }
}

/// How to decide whether a packet is outbound (client -> server).
///
/// Grounded in `original_source/packetparser.go`'s `CLIENT_IP` direction
/// mode: a packet is outbound when its source address falls in one of the
/// configured client subnets. The original's MAC-address-based mode has no
/// counterpart here, since it only makes sense capturing directly off a
/// switched interface.
///
/// ## Example
/// ```toml
/// [direction]
///     client_subnets = ["10.0.0.0/8", "192.168.0.0/16"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DirectionConfig {
    /// CIDR blocks identifying the local/client side of traffic. A packet
    /// whose source address falls in one of these is outbound.
    pub client_subnets: Vec<String>,
}

fn default_online() -> Option<OnlineConfig> {
    None
}

fn default_offline() -> Option<OfflineConfig> {
    None
}

/// Flow-table tuning.
///
/// ## Example
/// ```toml
/// [flow]
///     idle_timeout_ms = 300_000
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowConfig {
    /// How long (in milliseconds) a flow may go without a packet before it
    /// is evicted from the flow table. Defaults to `300_000` (5 minutes).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

/// JSON-line sink settings.
///
/// ## Example
/// ```toml
/// [sink]
///     path = "./telemetry.jsonl"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Output path for the JSON-lines telemetry dump.
    pub path: String,
}

/// Live traffic analysis options.
///
/// ## Example
/// ```toml
/// [online]
///     interface = "eth0"
///     promiscuous = true
///     snaplen = 65535
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OnlineConfig {
    /// Network interface name to capture from.
    pub interface: String,

    /// Whether to place the interface in promiscuous mode. Defaults to
    /// `true`.
    #[serde(default = "default_promiscuous")]
    pub promiscuous: bool,

    /// Maximum bytes captured per packet. Defaults to `65535`.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
}

fn default_promiscuous() -> bool {
    true
}

fn default_snaplen() -> i32 {
    65535
}

/// Offline (pcap file) capture options.
///
/// ## Example
/// ```toml
/// [offline]
///     pcap = "sample_pcaps/small_flows.pcap"
///     max_packets = 1_000_000
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OfflineConfig {
    /// Path to the packet capture file to replay.
    pub pcap: String,

    /// Stop after this many packets. Defaults to unlimited.
    #[serde(default = "default_max_packets")]
    pub max_packets: Option<u64>,
}

fn default_max_packets() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_offline_but_not_online() {
        let config = default_config();
        assert!(config.offline.is_some());
        assert!(config.online.is_none());
    }

    #[test]
    fn rejects_config_with_both_online_and_offline() {
        let toml_str = r#"
            [flow]
            [sink]
            path = "out.jsonl"
            [online]
            interface = "eth0"
            [offline]
            pcap = "x.pcap"
        "#;
        let dir = std::env::temp_dir();
        let path = dir.join(format!("telemetry-config-test-{}.toml", std::process::id()));
        std::fs::write(&path, toml_str).unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousSource));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_config_with_neither_online_nor_offline() {
        let toml_str = r#"
            [flow]
            [sink]
            path = "out.jsonl"
        "#;
        let dir = std::env::temp_dir();
        let path = dir.join(format!("telemetry-config-test-neither-{}.toml", std::process::id()));
        std::fs::write(&path, toml_str).unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousSource));
        std::fs::remove_file(&path).ok();
    }
}
