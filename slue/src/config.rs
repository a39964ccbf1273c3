//! Configuration of the sidelink UE application
//!
//! Loaded from TOML, or from YAML when the file ends in `.yaml`/`.yml`.

use anyhow::{bail, Context};
use common::{CastType, SubcarrierSpacing};
use layers::mac::sidelink::{
    NrSlUeMacConfig, SchedulerConfig, SidelinkLcIdentifier, SidelinkLogicalChannelInfo, SlPoolConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlUeConfig {
    pub ue: UeConfig,
    #[serde(default)]
    pub mac: NrSlUeMacConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pool: SlPoolConfig,
    #[serde(default)]
    pub logical_channels: Vec<LogicalChannelConfig>,
    #[serde(default)]
    pub traffic: Vec<TrafficConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Identity of the UE
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UeConfig {
    /// Layer 2 source id (24 bits)
    pub src_l2_id: u32,
    #[serde(default = "default_rnti")]
    pub rnti: u16,
    #[serde(default)]
    pub numerology: u8,
    /// Seed of the scheduler random streams
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// RLC queue limit per logical channel in bytes
    #[serde(default = "default_rlc_max_queue_bytes")]
    pub rlc_max_queue_bytes: usize,
}

fn default_rnti() -> u16 {
    1
}

fn default_seed() -> u64 {
    1
}

fn default_rlc_max_queue_bytes() -> usize {
    1_000_000
}

/// Sidelink logical channel towards one destination
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogicalChannelConfig {
    pub dst_l2_id: u32,
    pub lcid: u8,
    #[serde(default = "default_lc_group")]
    pub lc_group: u8,
    /// PC5 QoS identifier
    #[serde(default = "default_pqi")]
    pub pqi: u8,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub is_gbr: bool,
    #[serde(default)]
    pub mbr: u64,
    #[serde(default)]
    pub gbr: u64,
    #[serde(default = "default_cast_type")]
    pub cast_type: CastType,
    #[serde(default)]
    pub harq_enabled: bool,
    /// Packet delay budget in ms, 0 for none
    #[serde(default)]
    pub pdb_ms: u32,
    #[serde(default = "default_true")]
    pub dynamic: bool,
    /// Reservation period for SPS in ms
    #[serde(default)]
    pub rri_ms: u16,
}

fn default_lc_group() -> u8 {
    3
}

fn default_pqi() -> u8 {
    5
}

fn default_priority() -> u8 {
    1
}

fn default_cast_type() -> CastType {
    CastType::Groupcast
}

fn default_true() -> bool {
    true
}

impl LogicalChannelConfig {
    pub fn id(&self, src_l2_id: u32) -> SidelinkLcIdentifier {
        SidelinkLcIdentifier::new(src_l2_id, self.dst_l2_id, self.lcid)
    }

    pub fn to_info(&self, src_l2_id: u32) -> SidelinkLogicalChannelInfo {
        SidelinkLogicalChannelInfo {
            src_l2_id,
            dst_l2_id: self.dst_l2_id,
            lc_id: self.lcid,
            lc_group: self.lc_group,
            pqi: self.pqi,
            priority: self.priority,
            is_gbr: self.is_gbr,
            mbr: self.mbr,
            gbr: self.gbr,
            cast_type: self.cast_type,
            harq_enabled: self.harq_enabled,
            pdb_ms: self.pdb_ms,
            dynamic: self.dynamic,
            rri_ms: self.rri_ms,
        }
    }
}

/// Periodic packet source feeding one logical channel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    pub dst_l2_id: u32,
    pub lcid: u8,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,
    #[serde(default)]
    pub start_ms: u32,
}

fn default_packet_size() -> usize {
    200
}

fn default_interval_ms() -> u32 {
    100
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default filter when neither RUST_LOG nor --log-level is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SlUeConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
        let config = if is_yaml { Self::from_yaml_str(&contents)? } else { Self::from_toml_str(&contents)? };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).context("Invalid TOML configuration")
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents).context("Invalid YAML configuration")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.mac.validate()?;
        if SubcarrierSpacing::from_numerology(self.ue.numerology).is_none() {
            bail!("Unsupported numerology {}", self.ue.numerology);
        }
        if self.logical_channels.is_empty() {
            bail!("At least one logical channel must be configured");
        }
        for traffic in &self.traffic {
            if traffic.interval_ms == 0 || traffic.packet_size == 0 {
                bail!("Traffic to {} needs a non-zero interval and packet size", traffic.dst_l2_id);
            }
            let configured = self
                .logical_channels
                .iter()
                .any(|lc| lc.dst_l2_id == traffic.dst_l2_id && lc.lcid == traffic.lcid);
            if !configured {
                bail!("Traffic targets unconfigured LC {} of destination {}", traffic.lcid, traffic.dst_l2_id);
            }
        }
        Ok(())
    }
}
