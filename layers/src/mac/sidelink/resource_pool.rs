//! Sidelink Communication Resource Pool
//!
//! Bitmap-based sidelink resource pool according to 3GPP TS 38.331
//! (SL-ResourcePool) and TS 38.214 Section 8.1.2.

use crate::LayerError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sidelink slot offered by the pool inside a selection window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotInfo {
    /// Number of PRBs for PSCCH
    pub num_sl_pscch_rbs: u16,
    /// PSCCH starting symbol
    pub sl_pscch_sym_start: u16,
    /// PSCCH number of symbols
    pub sl_pscch_sym_length: u16,
    /// PSSCH starting symbol
    pub sl_pssch_sym_start: u16,
    /// PSSCH number of symbols (shortened when PSFCH is present)
    pub sl_pssch_sym_length: u16,
    /// Subchannel size in RBs
    pub sl_subchannel_size: u16,
    /// Maximum number of reserved resources per SCI
    pub sl_max_num_per_reserve: u16,
    /// PSFCH is present in this slot
    pub sl_has_psfch: bool,
    /// Absolute (normalized) slot index
    pub abs_slot_index: u64,
    /// Offset from the query slot
    pub slot_offset: u64,
}

/// Interface of a sidelink transmit pool as seen by the MAC
pub trait SlResourcePool: Send {
    /// Sidelink slots in `[abs_slot + t1, abs_slot + t2]`, both ends included
    fn opportunities(&self, abs_slot: u64, numerology: u8, t1: u16, t2: u16) -> Vec<SlotInfo>;

    /// Whether the physical slot belongs to the pool
    fn is_sidelink_slot(&self, abs_slot: u64) -> bool;

    /// Whether the physical slot carries PSFCH
    fn slot_has_psfch(&self, abs_slot: u64) -> bool;

    /// PSFCH period in sidelink slots, 0 when disabled
    fn psfch_period(&self) -> u8;

    /// Minimum gap between a PSSCH and its PSFCH, in slots
    fn min_time_gap_psfch(&self) -> u8;

    /// T2min in physical slots
    fn t2_min(&self, numerology: u8) -> u16;

    /// Sensing window T0 in physical slots
    fn sensing_window_slots(&self, numerology: u8) -> u16;

    /// Allowed reservation periods in ms
    fn reserve_period_list(&self) -> &[u16];

    /// Subchannel size in RBs
    fn subchannel_size(&self) -> u16;

    /// Number of subchannels of the pool
    fn total_subchannels(&self) -> u16;

    /// Maximum number of reserved resources indicated by one SCI 1-A
    fn max_num_per_reserve(&self) -> u16;

    /// Reservation period in physical slots
    fn reservation_period_in_slots(&self, rsvp_ms: u16, numerology: u8) -> u16 {
        rsvp_ms << numerology
    }
}

/// Serializable pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlPoolConfig {
    /// Sidelink bitmap, 1 marks a sidelink slot. Repeats over physical slots.
    #[serde(default = "default_bitmap")]
    pub bitmap: Vec<u8>,
    /// Bandwidth part size in RBs
    #[serde(default = "default_bandwidth_rbs")]
    pub bandwidth_rbs: u16,
    /// Subchannel size in RBs
    #[serde(default = "default_subchannel_size")]
    pub subchannel_size: u16,
    /// PRBs used by PSCCH
    #[serde(default = "default_num_pscch_rbs")]
    pub num_pscch_rbs: u16,
    /// PSCCH starting symbol
    #[serde(default = "default_sym_start")]
    pub pscch_sym_start: u16,
    /// PSCCH number of symbols
    #[serde(default = "default_pscch_sym_length")]
    pub pscch_sym_length: u16,
    /// PSSCH starting symbol
    #[serde(default = "default_sym_start")]
    pub pssch_sym_start: u16,
    /// PSFCH period in sidelink slots (0, 1, 2 or 4)
    #[serde(default)]
    pub psfch_period: u8,
    /// Minimum gap between PSSCH and PSFCH in slots (2 or 3)
    #[serde(default = "default_min_time_gap_psfch")]
    pub min_time_gap_psfch: u8,
    /// T2min in ms, scaled by 2^mu
    #[serde(default = "default_t2_min_ms")]
    pub t2_min_ms: u16,
    /// Sensing window T0 in ms
    #[serde(default = "default_sensing_window_ms")]
    pub sensing_window_ms: u16,
    /// Allowed reservation periods in ms
    #[serde(default = "default_reserve_period_list")]
    pub reserve_period_list: Vec<u16>,
    /// Maximum number of reserved resources per SCI (1..=3)
    #[serde(default = "default_max_num_per_reserve")]
    pub max_num_per_reserve: u16,
}

fn default_bitmap() -> Vec<u8> {
    vec![1; 10]
}

fn default_bandwidth_rbs() -> u16 {
    52
}

fn default_subchannel_size() -> u16 {
    10
}

fn default_num_pscch_rbs() -> u16 {
    10
}

fn default_sym_start() -> u16 {
    1
}

fn default_pscch_sym_length() -> u16 {
    3
}

fn default_min_time_gap_psfch() -> u8 {
    3
}

fn default_t2_min_ms() -> u16 {
    5
}

fn default_sensing_window_ms() -> u16 {
    100
}

fn default_reserve_period_list() -> Vec<u16> {
    vec![0, 100]
}

fn default_max_num_per_reserve() -> u16 {
    3
}

impl Default for SlPoolConfig {
    fn default() -> Self {
        Self {
            bitmap: default_bitmap(),
            bandwidth_rbs: default_bandwidth_rbs(),
            subchannel_size: default_subchannel_size(),
            num_pscch_rbs: default_num_pscch_rbs(),
            pscch_sym_start: default_sym_start(),
            pscch_sym_length: default_pscch_sym_length(),
            pssch_sym_start: default_sym_start(),
            psfch_period: 0,
            min_time_gap_psfch: default_min_time_gap_psfch(),
            t2_min_ms: default_t2_min_ms(),
            sensing_window_ms: default_sensing_window_ms(),
            reserve_period_list: default_reserve_period_list(),
            max_num_per_reserve: default_max_num_per_reserve(),
        }
    }
}

/// PSSCH symbols in a slot without PSFCH
pub const PSSCH_SYMBOLS: u16 = 12;
/// PSSCH symbols in a slot with PSFCH
pub const PSSCH_SYMBOLS_WITH_PSFCH: u16 = 9;
/// PSFCH symbol index inside the slot
pub const PSFCH_SYMBOL: u16 = 12;

/// Pool whose sidelink slots follow a repeating bitmap
#[derive(Debug, Clone)]
pub struct BitmapResourcePool {
    config: SlPoolConfig,
    sl_slots_per_period: u64,
    total_subchannels: u16,
}

impl BitmapResourcePool {
    /// Create a pool after validating its configuration
    pub fn new(config: SlPoolConfig) -> Result<Self, LayerError> {
        if config.bitmap.is_empty() {
            return Err(LayerError::InvalidConfiguration("Empty sidelink bitmap".into()));
        }
        if config.bitmap.iter().any(|b| *b > 1) {
            return Err(LayerError::InvalidConfiguration(
                "Sidelink bitmap entries must be 0 or 1".into(),
            ));
        }
        if config.subchannel_size == 0 || config.subchannel_size > config.bandwidth_rbs {
            return Err(LayerError::InvalidConfiguration(format!(
                "Subchannel size {} does not fit {} RBs",
                config.subchannel_size, config.bandwidth_rbs
            )));
        }
        if config.num_pscch_rbs > config.subchannel_size {
            return Err(LayerError::InvalidConfiguration(format!(
                "PSCCH RBs {} exceed subchannel size {}",
                config.num_pscch_rbs, config.subchannel_size
            )));
        }
        if !matches!(config.psfch_period, 0 | 1 | 2 | 4) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Invalid PSFCH period {}",
                config.psfch_period
            )));
        }
        if !(1..=3).contains(&config.max_num_per_reserve) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Invalid max num per reserve {}",
                config.max_num_per_reserve
            )));
        }

        let sl_slots_per_period = config.bitmap.iter().filter(|b| **b == 1).count() as u64;
        let total_subchannels = config.bandwidth_rbs / config.subchannel_size;
        debug!(
            "Sidelink pool: bitmap length {}, {} sidelink slots per period, {} subchannels of {} RBs",
            config.bitmap.len(),
            sl_slots_per_period,
            total_subchannels,
            config.subchannel_size
        );

        Ok(Self { config, sl_slots_per_period, total_subchannels })
    }

    pub fn config(&self) -> &SlPoolConfig {
        &self.config
    }

    /// Index of the slot among sidelink slots only
    fn logical_sl_index(&self, abs_slot: u64) -> u64 {
        let len = self.config.bitmap.len() as u64;
        let full_periods = abs_slot / len;
        let in_period = (abs_slot % len) as usize;
        let partial = self.config.bitmap[..in_period].iter().filter(|b| **b == 1).count() as u64;
        full_periods * self.sl_slots_per_period + partial
    }

    fn pssch_length(&self, has_psfch: bool) -> u16 {
        if has_psfch {
            PSSCH_SYMBOLS_WITH_PSFCH
        } else {
            PSSCH_SYMBOLS
        }
    }
}

impl SlResourcePool for BitmapResourcePool {
    fn opportunities(&self, abs_slot: u64, _numerology: u8, t1: u16, t2: u16) -> Vec<SlotInfo> {
        (t1 as u64..=t2 as u64)
            .filter(|offset| self.is_sidelink_slot(abs_slot + offset))
            .map(|offset| {
                let slot = abs_slot + offset;
                let has_psfch = self.slot_has_psfch(slot);
                SlotInfo {
                    num_sl_pscch_rbs: self.config.num_pscch_rbs,
                    sl_pscch_sym_start: self.config.pscch_sym_start,
                    sl_pscch_sym_length: self.config.pscch_sym_length,
                    sl_pssch_sym_start: self.config.pssch_sym_start,
                    sl_pssch_sym_length: self.pssch_length(has_psfch),
                    sl_subchannel_size: self.config.subchannel_size,
                    sl_max_num_per_reserve: self.config.max_num_per_reserve,
                    sl_has_psfch: has_psfch,
                    abs_slot_index: slot,
                    slot_offset: offset,
                }
            })
            .collect()
    }

    fn is_sidelink_slot(&self, abs_slot: u64) -> bool {
        let len = self.config.bitmap.len() as u64;
        self.config.bitmap[(abs_slot % len) as usize] == 1
    }

    fn slot_has_psfch(&self, abs_slot: u64) -> bool {
        let period = self.config.psfch_period as u64;
        period > 0 && self.is_sidelink_slot(abs_slot) && self.logical_sl_index(abs_slot) % period == 0
    }

    fn psfch_period(&self) -> u8 {
        self.config.psfch_period
    }

    fn min_time_gap_psfch(&self) -> u8 {
        self.config.min_time_gap_psfch
    }

    fn t2_min(&self, numerology: u8) -> u16 {
        self.config.t2_min_ms << numerology
    }

    fn sensing_window_slots(&self, numerology: u8) -> u16 {
        self.config.sensing_window_ms << numerology
    }

    fn reserve_period_list(&self) -> &[u16] {
        &self.config.reserve_period_list
    }

    fn subchannel_size(&self) -> u16 {
        self.config.subchannel_size
    }

    fn total_subchannels(&self) -> u16 {
        self.total_subchannels
    }

    fn max_num_per_reserve(&self) -> u16 {
        self.config.max_num_per_reserve
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_bitmap_opportunities() {
        let pool = BitmapResourcePool::new(SlPoolConfig::default()).unwrap();
        let slots = pool.opportunities(100, 0, 2, 33);
        assert_eq!(slots.len(), 32);
        assert_eq!(slots[0].slot_offset, 2);
        assert_eq!(slots.last().unwrap().abs_slot_index, 133);
        assert!(slots.iter().all(|s| s.sl_pssch_sym_length == PSSCH_SYMBOLS));
        assert_eq!(pool.total_subchannels(), 5);
    }

    #[test]
    fn test_empty_bitmap_gives_no_opportunities() {
        let config = SlPoolConfig { bitmap: vec![0; 10], ..Default::default() };
        let pool = BitmapResourcePool::new(config).unwrap();
        assert!(pool.opportunities(0, 0, 2, 33).is_empty());
    }

    #[test]
    fn test_partial_bitmap() {
        let config = SlPoolConfig { bitmap: vec![1, 0, 0, 1], ..Default::default() };
        let pool = BitmapResourcePool::new(config).unwrap();
        let slots: Vec<u64> = pool.opportunities(0, 0, 0, 9).iter().map(|s| s.abs_slot_index).collect();
        assert_eq!(slots, vec![0, 3, 4, 7, 8]);
    }

    #[test]
    fn test_psfch_on_logical_slots() {
        let config = SlPoolConfig { bitmap: vec![1, 0, 1, 1], psfch_period: 2, ..Default::default() };
        let pool = BitmapResourcePool::new(config).unwrap();
        // Sidelink slots 0, 2, 3, 4, 6, 7 have logical indices 0..=5
        assert!(pool.slot_has_psfch(0));
        assert!(!pool.slot_has_psfch(1));
        assert!(!pool.slot_has_psfch(2));
        assert!(pool.slot_has_psfch(3));
        assert!(pool.slot_has_psfch(6));
        let slot3 = pool.opportunities(0, 0, 3, 3);
        assert_eq!(slot3[0].sl_pssch_sym_length, PSSCH_SYMBOLS_WITH_PSFCH);
    }

    #[test]
    fn test_period_conversions() {
        let pool = BitmapResourcePool::new(SlPoolConfig::default()).unwrap();
        assert_eq!(pool.reservation_period_in_slots(100, 0), 100);
        assert_eq!(pool.reservation_period_in_slots(100, 2), 400);
        assert_eq!(pool.t2_min(1), 10);
        assert_eq!(pool.sensing_window_slots(1), 200);
    }

    #[test]
    fn test_invalid_pool_config() {
        let config = SlPoolConfig { psfch_period: 3, ..Default::default() };
        assert!(BitmapResourcePool::new(config).is_err());
        let config = SlPoolConfig { max_num_per_reserve: 4, ..Default::default() };
        assert!(BitmapResourcePool::new(config).is_err());
        let config = SlPoolConfig { bitmap: vec![], ..Default::default() };
        assert!(BitmapResourcePool::new(config).is_err());
    }
}
