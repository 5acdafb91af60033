//! Node configuration, stored as pretty printed JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message reliability parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MrpConfig {
    /// First retransmission delay; doubled for each following attempt.
    pub base_interval_ms: u64,
    pub max_retransmissions: u32,
    /// How long a received message may wait for a piggybacked acknowledgement.
    pub ack_deferral_ms: u64,
    /// Number of message counters remembered per session for duplicate detection.
    pub dedup_window: u32,
}

impl Default for MrpConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 300,
            max_retransmissions: 5,
            ack_deferral_ms: 200,
            dedup_window: 32,
        }
    }
}

impl MrpConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
    pub fn ack_deferral(&self) -> Duration {
        Duration::from_millis(self.ack_deferral_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionLimits {
    /// Smallest min interval the publisher agrees to.
    pub min_interval_floor_s: u16,
    /// Largest max interval the publisher agrees to.
    pub max_interval_ceiling_s: u16,
    /// Unacknowledged reports are tolerated for max interval times this factor.
    pub liveness_factor: u32,
    pub max_subscriptions: usize,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            min_interval_floor_s: 0,
            max_interval_ceiling_s: 3600,
            liveness_factor: 2,
            max_subscriptions: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mrp: MrpConfig,
    /// Upper bound for the TLV payload of one ReportData message.
    pub max_payload_size: usize,
    pub subscriptions: SubscriptionLimits,
    /// Slack a subscriber grants the publisher beyond the negotiated max interval.
    pub client_liveness_grace_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mrp: MrpConfig::default(),
            max_payload_size: 1024,
            subscriptions: SubscriptionLimits::default(),
            client_liveness_grace_ms: 5000,
        }
    }
}

pub fn load_config(path: &str) -> Result<NodeConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context(format!("parsing config {}", path))
}

pub fn save_config(path: &str, config: &NodeConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: NodeConfig = serde_json::from_str(r#"{"mrp": {"max_retransmissions": 3}, "max_payload_size": 512}"#).unwrap();
        assert_eq!(cfg.mrp.max_retransmissions, 3);
        assert_eq!(cfg.mrp.base_interval_ms, 300);
        assert_eq!(cfg.max_payload_size, 512);
        assert_eq!(cfg.subscriptions, SubscriptionLimits::default());
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir().join(format!("matim-config-{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let mut cfg = NodeConfig::default();
        cfg.subscriptions.max_subscriptions = 3;
        save_config(&path, &cfg).unwrap();
        assert_eq!(load_config(&path).unwrap(), cfg);
        let _ = std::fs::remove_file(&path);
        assert!(load_config(&path).is_err());
    }
}
