//! Device configuration, loaded from TOML (ambient stack addition).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Tunables for the outbound [`crate::regulator::Regulator`] (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorConfig {
    pub max_message_size: usize,
    pub min_emit_interval_ms: u64,
    pub max_queue_depth: usize,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        RegulatorConfig {
            max_message_size: 128 * 1024,
            min_emit_interval_ms: 20,
            max_queue_depth: 4096,
        }
    }
}

impl RegulatorConfig {
    pub fn min_emit_interval(&self) -> Duration {
        Duration::from_millis(self.min_emit_interval_ms)
    }
}

/// Tunables for the inbound [`crate::sequencer::Sequencer`] (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub max_buffered: usize,
    pub gap_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        SequencerConfig { max_buffered: 64, gap_timeout_ms: 500 }
    }
}

impl SequencerConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

/// Tunables for the lock-free [`crate::ring::DataStreamRing`] (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub capacity_bytes: usize,
    pub sample_rate_hz: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig { capacity_bytes: 16 * 16_000 * 2, sample_rate_hz: 16_000 }
    }
}

/// Top-level device configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub topic_root: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub regulator: RegulatorConfig,
    pub sequencer: SequencerConfig,
    pub ring: RingConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            topic_root: "devices/unknown".to_string(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 8883,
            regulator: RegulatorConfig::default(),
            sequencer: SequencerConfig::default(),
            ring: RingConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Other(format!("invalid device config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Other(format!("reading {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&text)
    }
}
