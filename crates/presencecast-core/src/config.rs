//! Transport configuration with validation.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! {"node_id": 7, "send_interfaces": ["10.0.0.2", "10.1.0.2"],
//!  "presence": {"interval_ms": 2000}}
//! ```

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};
use crate::transport::PortRange;
use crate::types::NodeId;

/// Interface name meaning "all interfaces"
pub const ANY_INTERFACE: &str = "ANY";

/// Top-level configuration of a transport service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Identifier of this proxy instance on the network
    pub node_id: u64,
    /// Interfaces objects are sent on
    pub send_interfaces: Vec<String>,
    /// Interfaces objects are received on
    pub recv_interfaces: Vec<String>,
    pub multicast_group: Ipv4Addr,
    /// Inclusive range, `"start-end"`
    pub port_range: String,
    /// zstd-compress envelopes and payloads
    pub compression: bool,
    /// Maximum entries in each channel's duplicate cache
    pub dedup_capacity: usize,
    pub engine: EngineParams,
    pub presence: PresenceConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: u64::from(rand::random::<u32>()) + 1,
            send_interfaces: vec![ANY_INTERFACE.to_string()],
            recv_interfaces: vec![ANY_INTERFACE.to_string()],
            multicast_group: Ipv4Addr::new(225, 0, 87, 4),
            port_range: "10001-10001".to_string(),
            compression: false,
            dedup_capacity: 4096,
            engine: EngineParams::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: TransportConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), node_id = config.node_id, "Loaded transport config");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> TransportResult<()> {
        if self.send_interfaces.is_empty() {
            return Err(TransportError::InvalidConfig(
                "send_interfaces cannot be empty".into(),
            ));
        }
        if self.recv_interfaces.is_empty() {
            return Err(TransportError::InvalidConfig(
                "recv_interfaces cannot be empty".into(),
            ));
        }
        self.ports()?;
        if self.presence.timeout_ticks == 0 {
            return Err(TransportError::InvalidConfig(
                "presence.timeout_ticks cannot be 0".into(),
            ));
        }
        if self.presence.grtt_multiplier == 0 {
            return Err(TransportError::InvalidConfig(
                "presence.grtt_multiplier cannot be 0".into(),
            ));
        }
        if self.presence.interval_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "presence.interval_ms cannot be 0".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "dedup_capacity cannot be 0".into(),
            ));
        }
        Ok(())
    }

    /// The parsed port range.
    pub fn ports(&self) -> TransportResult<PortRange> {
        self.port_range.parse()
    }

    pub fn local_node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }
}

/// Parameters handed to the engine when a sender or receiver starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    pub send_buffer_space: usize,
    pub recv_buffer_space: usize,
    pub segment_size: u16,
    pub block_size: u16,
    pub num_parity: u16,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            send_buffer_space: 65536,
            recv_buffer_space: 65536,
            segment_size: 1400,
            block_size: 64,
            num_parity: 16,
        }
    }
}

/// Presence gossip timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Snapshot broadcast period, and liveness tick until a GRTT is known
    pub interval_ms: u64,
    /// Liveness ticks without an accepted update before a peer is disconnected
    pub timeout_ticks: u32,
    /// Liveness tick = GRTT x multiplier; also the late-delivery threshold
    pub grtt_multiplier: u32,
    /// Further ticks a disconnected peer is kept before it is reaped, 0 keeps it
    pub reap_after_ticks: u32,
    /// `from` address of presence probes this node sends
    pub probe_from: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 4000,
            timeout_ticks: 3,
            grtt_multiplier: 1,
            reap_after_ticks: 20,
            probe_from: "proxy".to_string(),
        }
    }
}

impl PresenceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert!(config.node_id > 0);
        assert_eq!(config.multicast_group, Ipv4Addr::new(225, 0, 87, 4));
        assert_eq!(config.send_interfaces, vec!["ANY".to_string()]);
        assert_eq!(config.engine.segment_size, 1400);
        assert_eq!(config.presence.interval(), Duration::from_secs(4));
        assert_eq!(config.presence.timeout_ticks, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"node_id": 7, "presence": {"interval_ms": 500}}"#).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.presence.interval_ms, 500);
        assert_eq!(config.presence.timeout_ticks, 3);
        assert_eq!(config.dedup_capacity, 4096);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = TransportConfig::default();
        config.send_interfaces.clear();
        assert!(matches!(config.validate(), Err(TransportError::InvalidConfig(_))));

        let mut config = TransportConfig::default();
        config.port_range = "10005-10001".to_string();
        assert!(matches!(config.validate(), Err(TransportError::InvalidPortRange(_))));

        let mut config = TransportConfig::default();
        config.presence.timeout_ticks = 0;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.presence.grtt_multiplier = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"node_id": 3, "send_interfaces": ["eth0", "eth1"], "port_range": "10001-10010"}}"#
        )
        .unwrap();

        let config = TransportConfig::load(file.path()).unwrap();
        assert_eq!(config.local_node_id(), NodeId(3));
        assert_eq!(config.send_interfaces.len(), 2);
        assert_eq!(config.ports().unwrap().len(), 10);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"recv_interfaces": []}}"#).unwrap();
        assert!(TransportConfig::load(file.path()).is_err());
    }
}
