//! Sidelink UE MAC Schedulers
//!
//! UE-selected (mode 2) sidelink scheduling according to 3GPP TS 38.321
//! Section 5.22.1. The scheduler decides which destination and logical
//! channels to serve, selects resources among the candidates offered by the
//! MAC and publishes grants back to it one transmission at a time.

pub mod fixed_mcs;
pub mod grant;
pub mod simple;

use crate::LayerError;
use common::{CastType, SfnSf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::harq::NrSlUeMacHarq;
use super::lcg::{SlDestinationInfo, SlLogicalChannel};
use super::phy_mac_common::{
    GrantSlots, NrSlGrant, NrSlReportBufferStatus, NrSlTransmissionParams, SidelinkLogicalChannelInfo,
    SlGrantResource, SlResourceInfo, SlRlcPduInfo,
};

pub use fixed_mcs::NrSlUeMacSchedulerFixedMcs;
pub use grant::GrantLifecycleManager;
pub use simple::NrSlUeMacSchedulerSimple;

/// Services of the UE MAC used by a scheduler during a scheduling pass
pub trait SchedulerMac {
    /// Candidate resources for the given transmission parameters
    fn candidate_resources(
        &mut self,
        sfn: &SfnSf,
        params: &NrSlTransmissionParams,
    ) -> Result<Vec<SlResourceInfo>, LayerError>;

    /// HARQ entity of the MAC
    fn harq(&mut self) -> &mut NrSlUeMacHarq;

    /// Hand a published grant to the MAC
    fn sched_config_ind(&mut self, dst_l2_id: u32, grant: NrSlGrant);

    /// Whether a sidelink slot carries PSFCH
    fn slot_has_psfch(&self, sfn: &SfnSf) -> bool;

    /// PSFCH period of the pool in slots, 0 without PSFCH
    fn psfch_period(&self) -> u8;

    /// Reservation period converted to physical slots
    fn reservation_period_in_slots(&self, rri_ms: u16, numerology: u8) -> u16;

    fn total_subchannels(&self) -> u16;

    fn subchannel_size(&self) -> u16;

    /// Maximum number of PSSCH transmissions of one TB
    fn max_tx_trans_num_pssch(&self) -> u8;

    /// Probability of keeping an SPS resource at re-selection
    fn prob_resource_keep(&self) -> f64;

    /// Start of the selection window in slots
    fn t1(&self) -> u8;
}

/// Sidelink scheduling policy
pub trait NrSlUeMacScheduler: Send {
    /// Configure a logical channel of a destination
    fn csched_lc_config_req(&mut self, params: &SidelinkLogicalChannelInfo) -> Result<(), LayerError>;

    /// Remove a logical channel of a destination
    fn remove_lc_config_req(&mut self, lcid: u8, dst_l2_id: u32);

    /// Buffer status report from RLC
    fn sched_rlc_buffer_req(&mut self, params: &NrSlReportBufferStatus) -> Result<(), LayerError>;

    /// Run one scheduling pass at `sfn`
    fn sched_trigger_req(&mut self, sfn: &SfnSf, mac: &mut dyn SchedulerMac) -> Result<(), LayerError>;

    /// Bytes of an LC handed to the MAC by RLC
    fn notify_pdu_dequeue(&mut self, dst_l2_id: u32, lcid: u8, size: u32) -> Result<(), LayerError>;

    /// Re-seed the random streams, returning the number of streams used
    fn assign_streams(&mut self, seed: u64) -> u64;

    /// Scheduler state of a destination
    fn dst_info(&self, dst_l2_id: u32) -> Option<&SlDestinationInfo>;

    /// Grants currently held by the scheduler
    fn grants(&self) -> &GrantLifecycleManager;
}

/// Scheduling policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// Multiple LCs per destination, fixed MCS
    #[default]
    FixedMcs,
    /// Single LC per destination
    Simple,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerKind,

    /// Fixed MCS used for every destination
    #[serde(default = "default_mcs")]
    pub mcs: u8,

    /// SPS wins a priority tie between dynamic and SPS LCs
    #[serde(default = "default_true")]
    pub priority_to_sps: bool,

    /// Allow several destinations in the same slot on disjoint subchannels
    #[serde(default)]
    pub allow_multiple_destinations_per_slot: bool,

    /// Retransmission window of the simple scheduler in slots
    #[serde(default = "default_re_tx_window")]
    pub re_tx_window: u16,
}

fn default_mcs() -> u8 {
    14
}

fn default_true() -> bool {
    true
}

fn default_re_tx_window() -> u16 {
    32
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::default(),
            mcs: default_mcs(),
            priority_to_sps: true,
            allow_multiple_destinations_per_slot: false,
            re_tx_window: default_re_tx_window(),
        }
    }
}

/// Create the scheduler selected by the configuration
pub fn create_scheduler(config: &SchedulerConfig, seed: u64) -> Result<Box<dyn NrSlUeMacScheduler>, LayerError> {
    info!("Creating {:?} sidelink scheduler with MCS {}", config.kind, config.mcs);
    match config.kind {
        SchedulerKind::FixedMcs => Ok(Box::new(NrSlUeMacSchedulerFixedMcs::new(config.clone(), seed)?)),
        SchedulerKind::Simple => Ok(Box::new(NrSlUeMacSchedulerSimple::new(config.clone(), seed)?)),
    }
}

/// Outcome of logical channel prioritization, consumed by the allocator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationInfo {
    pub priority: u8,
    pub is_dynamic: bool,
    pub harq_enabled: bool,
    /// Transport block size in bytes
    pub tb_size: u32,
    pub allocated_rlc_pdus: Vec<SlRlcPduInfo>,
    /// Reservation period in ms, SPS only
    pub rri_ms: u16,
    pub cast_type: CastType,
    /// Resource re-selection counter drawn for an SPS grant
    pub resel_counter: u8,
    /// Selection horizon, `resel_counter * 10`
    pub c_resel: u16,
}

/// Grant held by the scheduler until all of its slots are published, or for
/// SPS until the re-selection check releases it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantInfo {
    pub c_resel_counter: u16,
    pub sl_reso_resel_counter: u8,
    /// Counter value restored when the resource is kept
    pub prev_sl_reso_resel_counter: u8,
    pub slot_allocations: GrantSlots,
    /// Slots of the most recently published reservation period
    pub reserved_slots: GrantSlots,
    pub harq_id: u8,
    pub n_selected: u8,
    pub tb_tx_counter: u8,
    pub is_dynamic: bool,
    pub harq_enabled: bool,
    pub rri_ms: u16,
    pub cast_type: CastType,
}

impl GrantInfo {
    /// Whether the grant serves `lcid`
    pub fn covers_lc(&self, lcid: u8) -> bool {
        self.lc_slot()
            .is_some_and(|slot| slot.sl_rlc_pdu_info.iter().any(|pdu| pdu.lcid == lcid))
    }

    /// Whether the grant serves exactly the LCs of `pdus`
    pub fn covers_same_lcs(&self, pdus: &[SlRlcPduInfo]) -> bool {
        match self.lc_slot() {
            Some(slot) if slot.sl_rlc_pdu_info.len() == pdus.len() => slot
                .sl_rlc_pdu_info
                .iter()
                .all(|existing| pdus.iter().any(|pdu| pdu.lcid == existing.lcid)),
            _ => false,
        }
    }

    /// An SPS grant that used up its reservation still serves its LCs
    /// until the re-selection check keeps or releases it
    fn lc_slot(&self) -> Option<&SlGrantResource> {
        self.slot_allocations.first().or_else(|| self.reserved_slots.first())
    }
}

/// Per-destination scheduler state shared by the policies
#[derive(Debug, Clone, Default)]
pub struct DstInfoMap {
    mcs: u8,
    dsts: BTreeMap<u32, SlDestinationInfo>,
}

impl DstInfoMap {
    pub fn new(mcs: u8) -> Self {
        Self { mcs, dsts: BTreeMap::new() }
    }

    /// Add an LC, creating its destination and LCG on first use
    pub fn configure_lc(&mut self, params: &SidelinkLogicalChannelInfo) -> Result<(), LayerError> {
        let mcs = self.mcs;
        let dst = self.dsts.entry(params.dst_l2_id).or_insert_with(|| {
            debug!("Creating scheduler info for destination {} with MCS {}", params.dst_l2_id, mcs);
            SlDestinationInfo::new(params.dst_l2_id, mcs)
        });
        dst.lcg_or_insert(params.lc_group)
            .insert(SlLogicalChannel::new(params), params.dst_l2_id)?;
        debug!(
            "Configured LC {} in LCG {} for destination {}",
            params.lc_id, params.lc_group, params.dst_l2_id
        );
        Ok(())
    }

    /// Remove an LC from every LCG of a destination
    pub fn remove_lc(&mut self, lcid: u8, dst_l2_id: u32) {
        match self.dsts.get_mut(&dst_l2_id) {
            Some(dst) => {
                for lcg in dst.lcgs_mut().values_mut() {
                    lcg.remove(lcid);
                }
            }
            None => debug!("No scheduler info for destination {}", dst_l2_id),
        }
    }

    /// Apply a buffer status report
    pub fn update_buffer(&mut self, params: &NrSlReportBufferStatus) -> Result<(), LayerError> {
        let dst = self
            .dsts
            .get_mut(&params.dst_l2_id)
            .ok_or(LayerError::UnknownDestination(params.dst_l2_id))?;
        let lcg = dst
            .lcg_of_mut(params.lcid)
            .ok_or(LayerError::UnknownLogicalChannel { dst: params.dst_l2_id, lcid: params.lcid })?;
        lcg.update_info(params)
    }

    /// Account bytes dequeued from an LC
    pub fn assigned_data(&mut self, dst_l2_id: u32, lcid: u8, size: u32) -> Result<(), LayerError> {
        let dst = self
            .dsts
            .get_mut(&dst_l2_id)
            .ok_or(LayerError::UnknownDestination(dst_l2_id))?;
        let lcg = dst
            .lcg_of_mut(lcid)
            .ok_or(LayerError::UnknownLogicalChannel { dst: dst_l2_id, lcid })?;
        lcg.assigned_data(lcid, size)
    }

    pub fn get(&self, dst_l2_id: u32) -> Option<&SlDestinationInfo> {
        self.dsts.get(&dst_l2_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &SlDestinationInfo)> {
        self.dsts.iter()
    }

    /// Logical channel of a destination
    pub fn lc(&self, dst_l2_id: u32, lcid: u8) -> Option<&SlLogicalChannel> {
        self.dsts.get(&dst_l2_id)?.lcg_of(lcid)?.lc(lcid)
    }
}
