//! Sidelink UE MAC
//!
//! Owns the transmit pool, sensing buffers, HARQ entity and published grants
//! of one UE, drives its scheduler once per slot and turns grants into
//! PSCCH/PSSCH transmissions (3GPP TS 38.321 Section 5.22).

use crate::mac::{decode_sub_pdus, encode_sub_pdus, MacSdu};
use crate::LayerError;
use bytes::Bytes;
use common::{bytes_to_hex, L2Id, SfnSf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, trace, warn};

use super::candidate::{
    remove_old_sensing_data, remove_old_transmit_history, CandidateResourceGenerator, SensingConfig,
};
use super::harq::NrSlUeMacHarq;
use super::phy_mac_common::{
    NrSlGrant, NrSlReportBufferStatus, NrSlRlcPdu, NrSlTransmissionParams, NrSlTxOpportunity, SensingData,
    SensingTraceReport, SidelinkLcIdentifier, SidelinkLogicalChannelInfo, SlGrantResource, SlHarqInfo,
    SlPscchUeMacStat, SlPsschUeMacStat, SlResourceInfo, SlVarTtiAllocInfo, SlVarTtiType, NO_VALUE,
};
use super::resource_pool::{SlResourcePool, PSFCH_SYMBOL};
use super::scheduler::{NrSlUeMacScheduler, SchedulerMac};
use super::sci::{SciStage1A, SciStage2A};

/// Largest configurable number of PSSCH transmissions of one TB
pub const MAX_TX_TRANS_NUM_PSSCH: u8 = 32;

/// LC ids up to this value belong to signalling bearers
const MAX_SRB_LCID: u8 = 3;

/// MAC-level configuration of a sidelink UE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NrSlUeMacConfig {
    /// Sensing-based candidate exclusion
    #[serde(default)]
    pub enable_sensing: bool,

    /// Start of the selection window in slots
    #[serde(default = "default_t1")]
    pub t1: u8,

    /// End of the selection window in slots
    #[serde(default = "default_t2")]
    pub t2: u16,

    /// Tproc0 in slots
    #[serde(default = "default_tproc0")]
    pub tproc0: u8,

    /// Initial RSRP threshold in dBm
    #[serde(default = "default_thres_rsrp")]
    pub thres_rsrp: i32,

    /// Minimum share of candidates that must survive sensing, in percent
    #[serde(default = "default_resource_percentage")]
    pub resource_percentage: u8,

    /// MAC processing gap after a PSFCH, in slots
    #[serde(default = "default_min_time_gap_processing")]
    pub min_time_gap_processing: u8,

    /// Maximum number of PSSCH transmissions of one TB
    #[serde(default = "default_max_tx_trans_num_pssch")]
    pub max_tx_trans_num_pssch: u8,

    /// Probability of keeping SPS resources at re-selection
    #[serde(default)]
    pub prob_resource_keep: f64,

    /// HARQ processes per destination
    #[serde(default = "default_num_harq_processes")]
    pub num_harq_processes: u8,

    /// HARQ processes per destination usable by SPS grants
    #[serde(default = "default_num_harq_processes_multiple_pdu")]
    pub num_harq_processes_multiple_pdu: u8,
}

fn default_t1() -> u8 {
    2
}

fn default_t2() -> u16 {
    33
}

fn default_tproc0() -> u8 {
    1
}

fn default_thres_rsrp() -> i32 {
    -128
}

fn default_resource_percentage() -> u8 {
    20
}

fn default_min_time_gap_processing() -> u8 {
    2
}

fn default_max_tx_trans_num_pssch() -> u8 {
    5
}

fn default_num_harq_processes() -> u8 {
    16
}

fn default_num_harq_processes_multiple_pdu() -> u8 {
    4
}

impl Default for NrSlUeMacConfig {
    fn default() -> Self {
        Self {
            enable_sensing: false,
            t1: default_t1(),
            t2: default_t2(),
            tproc0: default_tproc0(),
            thres_rsrp: default_thres_rsrp(),
            resource_percentage: default_resource_percentage(),
            min_time_gap_processing: default_min_time_gap_processing(),
            max_tx_trans_num_pssch: default_max_tx_trans_num_pssch(),
            prob_resource_keep: 0.0,
            num_harq_processes: default_num_harq_processes(),
            num_harq_processes_multiple_pdu: default_num_harq_processes_multiple_pdu(),
        }
    }
}

impl NrSlUeMacConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.max_tx_trans_num_pssch == 0 || self.max_tx_trans_num_pssch > MAX_TX_TRANS_NUM_PSSCH {
            return Err(LayerError::InvalidConfiguration(format!(
                "Number of PSSCH transmissions {} outside 1..={}",
                self.max_tx_trans_num_pssch, MAX_TX_TRANS_NUM_PSSCH
            )));
        }
        if !(0.0..=1.0).contains(&self.prob_resource_keep) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Probability of resource keep {} must be between 0 and 1",
                self.prob_resource_keep
            )));
        }
        if !(1..=100).contains(&self.resource_percentage) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Resource percentage {} outside 1..=100",
                self.resource_percentage
            )));
        }
        Ok(())
    }

    pub fn sensing_config(&self) -> SensingConfig {
        SensingConfig {
            enable_sensing: self.enable_sensing,
            t1: self.t1,
            t2: self.t2,
            tproc0: self.tproc0,
            thres_rsrp: self.thres_rsrp,
            resource_percentage: self.resource_percentage,
            min_time_gap_processing: self.min_time_gap_processing,
        }
    }
}

/// MAC service user, implemented by the RLC
pub trait NrSlMacSapUser {
    /// Transmit opportunity for one LC, answered with the PDUs to send
    fn notify_tx_opportunity(&mut self, opportunity: &NrSlTxOpportunity) -> Vec<NrSlRlcPdu>;

    /// PDU received from a peer
    fn receive_rlc_pdu(&mut self, pdu: NrSlRlcPdu);
}

/// One PSSCH transmission: SCI stage 2 followed by the MAC PDUs of a TB
#[derive(Debug, Clone, PartialEq)]
pub struct SlPsschTransmission {
    pub dst_l2_id: u32,
    pub harq_id: u8,
    pub sci2a: Bytes,
    pub pdus: Vec<Bytes>,
}

/// Everything the MAC hands to the PHY for one sidelink slot
#[derive(Debug, Clone, PartialEq)]
pub struct NrSlSlotTransmission {
    pub sfn: SfnSf,
    pub var_tti_allocs: Vec<SlVarTtiAllocInfo>,
    /// Encoded SCI 1-A messages
    pub pscch: Vec<Bytes>,
    pub pssch: Vec<SlPsschTransmission>,
    pub pscch_stats: Vec<SlPscchUeMacStat>,
    pub pssch_stats: Vec<SlPsschUeMacStat>,
}

impl NrSlSlotTransmission {
    fn new(sfn: SfnSf) -> Self {
        Self {
            sfn,
            var_tti_allocs: Vec::new(),
            pscch: Vec::new(),
            pssch: Vec::new(),
            pscch_stats: Vec::new(),
            pssch_stats: Vec::new(),
        }
    }

    /// Whether a PSCCH or PSSCH was sent
    pub fn has_data(&self) -> bool {
        !self.pssch.is_empty()
    }
}

/// Outcome of one PSSCH reception
#[derive(Debug, Clone, PartialEq)]
pub struct PsschReception {
    /// RLC PDUs handed to the RLC
    pub delivered: usize,
    /// HARQ feedback to send on PSFCH
    pub feedback: Option<SlHarqInfo>,
}

/// Counters of the transmission step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NrSlUeMacStats {
    pub grants_received: u64,
    pub new_transmissions: u64,
    pub retransmissions: u64,
    pub pscch_transmissions: u64,
    pub wasted_grants: u64,
    pub wasted_retransmissions: u64,
    /// MAC PDU bytes of new transmissions
    pub bytes_sent: u64,
    pub acks_received: u64,
}

/// MAC state reachable by the scheduler during a scheduling pass
struct MacCore {
    rnti: u16,
    src_l2_id: u32,
    config: NrSlUeMacConfig,
    pool: Box<dyn SlResourcePool>,
    generator: CandidateResourceGenerator,
    sensing_data: Vec<SensingData>,
    transmit_history: Vec<SfnSf>,
    harq: NrSlUeMacHarq,
    grants: BTreeMap<u32, Vec<NrSlGrant>>,
    pending_tx_opps: VecDeque<NrSlTxOpportunity>,
    lcs: BTreeMap<SidelinkLcIdentifier, SidelinkLogicalChannelInfo>,
    last_sensing_report: Option<SensingTraceReport>,
    stats: NrSlUeMacStats,
}

impl SchedulerMac for MacCore {
    fn candidate_resources(
        &mut self,
        sfn: &SfnSf,
        params: &NrSlTransmissionParams,
    ) -> Result<Vec<SlResourceInfo>, LayerError> {
        let selection =
            self.generator
                .candidates(sfn, params, &*self.pool, &self.sensing_data, &self.transmit_history)?;
        trace!("Candidate query at {} ({}): {:?}", sfn, params, selection.report);
        self.last_sensing_report = Some(selection.report);
        Ok(selection.resources)
    }

    fn harq(&mut self) -> &mut NrSlUeMacHarq {
        &mut self.harq
    }

    fn sched_config_ind(&mut self, dst_l2_id: u32, mut grant: NrSlGrant) {
        info!(
            "Received grant to {} on HARQ ID {} with {} slots and RRI {} ms",
            dst_l2_id,
            grant.harq_id,
            grant.slot_allocations.len(),
            grant.rri_ms
        );
        self.stats.grants_received += 1;
        self.harq.update_harq_process(
            dst_l2_id,
            grant.harq_id,
            grant.slot_allocations.len() as u8,
            grant.harq_enabled,
            grant.tb_size,
        );

        let new_data: Vec<&SlGrantResource> = grant.slot_allocations.iter().filter(|s| s.ndi == 1).collect();
        if !new_data.is_empty() {
            // A new TB replaces whatever an SPS process still buffers
            self.harq.flush(dst_l2_id, grant.harq_id);
        }
        for slot in new_data {
            for pdu_info in &slot.sl_rlc_pdu_info {
                let key = SidelinkLcIdentifier::new(self.src_l2_id, dst_l2_id, pdu_info.lcid);
                if !self.lcs.contains_key(&key) {
                    debug!("No LC {} found for destination {}", pdu_info.lcid, dst_l2_id);
                    continue;
                }
                debug!("Queueing TX opportunity of {} bytes for LC {}", pdu_info.size, pdu_info.lcid);
                self.pending_tx_opps.push_back(NrSlTxOpportunity {
                    bytes: pdu_info.size,
                    rnti: self.rnti,
                    lcid: pdu_info.lcid,
                    harq_id: grant.harq_id,
                    src_l2_id: self.src_l2_id,
                    dst_l2_id,
                });
            }
        }

        grant.tb_tx_counter = 0;
        self.grants.entry(dst_l2_id).or_default().push(grant);
    }

    fn slot_has_psfch(&self, sfn: &SfnSf) -> bool {
        self.pool.slot_has_psfch(sfn.normalize())
    }

    fn psfch_period(&self) -> u8 {
        self.pool.psfch_period()
    }

    fn reservation_period_in_slots(&self, rri_ms: u16, numerology: u8) -> u16 {
        self.pool.reservation_period_in_slots(rri_ms, numerology)
    }

    fn total_subchannels(&self) -> u16 {
        self.pool.total_subchannels()
    }

    fn subchannel_size(&self) -> u16 {
        self.pool.subchannel_size()
    }

    fn max_tx_trans_num_pssch(&self) -> u8 {
        self.config.max_tx_trans_num_pssch
    }

    fn prob_resource_keep(&self) -> f64 {
        self.config.prob_resource_keep
    }

    fn t1(&self) -> u8 {
        self.config.t1
    }
}

/// Pool and identity values needed to build one slot's transmissions
#[derive(Debug, Clone, Copy)]
struct TxContext {
    sfn: SfnSf,
    rnti: u16,
    src_l2_id: u32,
    subchannel_size: u16,
    total_subchannels: u16,
    psfch_period: u8,
}

impl TxContext {
    fn pssch(&self, grant: &NrSlGrant, slot: &SlGrantResource, burst: Vec<Bytes>, tx: &mut NrSlSlotTransmission) {
        let sci2a = SciStage2A {
            harq_id: grant.harq_id,
            ndi: slot.ndi,
            rv: slot.rv,
            src_id: L2Id::new(self.src_l2_id).lsb8(),
            dst_id: L2Id::new(slot.dst_l2_id).lsb16(),
            csi_req: 0,
            zone_id: 0,
            comm_range: 0,
            cast_type: grant.cast_type,
            harq_feedback_indicator: grant.harq_enabled && self.psfch_period > 0,
        };
        let rb_start = slot.sl_pssch_subch_start * self.subchannel_size;
        let rb_length = slot.sl_pssch_subch_length * self.subchannel_size;
        tx.var_tti_allocs.push(SlVarTtiAllocInfo {
            sym_start: slot.sl_pssch_sym_start,
            sym_length: slot.sl_pssch_sym_length,
            rb_start,
            rb_length,
            kind: SlVarTtiType::Data,
        });
        tx.pssch_stats.push(SlPsschUeMacStat {
            sfn: slot.sfn,
            rnti: self.rnti,
            sym_start: slot.sl_pssch_sym_start,
            sym_length: slot.sl_pssch_sym_length,
            sub_channel_size: self.subchannel_size,
            rb_start,
            rb_length,
            harq_id: grant.harq_id,
            ndi: slot.ndi,
            rv: slot.rv,
            src_l2_id: self.src_l2_id,
            dst_l2_id: slot.dst_l2_id,
            csi_req: sci2a.csi_req,
            cast_type: grant.cast_type,
        });
        tx.pssch.push(SlPsschTransmission {
            dst_l2_id: slot.dst_l2_id,
            harq_id: grant.harq_id,
            sci2a: sci2a.encode(),
            pdus: burst,
        });
    }

    /// SCI 1-A announcing the slots that follow in `grant`
    fn pscch(&self, grant: &NrSlGrant, slot: &SlGrantResource, tx: &mut NrSlSlotTransmission) -> Result<(), LayerError> {
        let mut sci = SciStage1A::new(
            slot.priority,
            slot.mcs,
            grant.rri_ms,
            self.total_subchannels,
            slot.sl_pssch_subch_start as u8,
            slot.sl_pssch_subch_length as u8,
            slot.max_num_per_reserve as u8,
        );
        let now = self.sfn.normalize();
        let reserved = grant
            .slot_allocations
            .iter()
            .take(slot.slot_num_ind.saturating_sub(1) as usize)
            .map(|next| retx_gap(now, &next.sfn).map(|gap| (gap, next.sl_pssch_subch_start as u8)))
            .collect::<Result<Vec<(u8, u8)>, LayerError>>()?;
        if let Some((gap, start)) = reserved.first() {
            sci.set_re_tx1(*gap, *start)?;
        }
        if let Some((gap, start)) = reserved.get(1) {
            sci.set_re_tx2(*gap, *start)?;
        }

        let rb_start = slot.sl_pssch_subch_start * self.subchannel_size;
        tx.var_tti_allocs.push(SlVarTtiAllocInfo {
            sym_start: slot.sl_pscch_sym_start,
            sym_length: slot.sl_pscch_sym_length,
            rb_start,
            rb_length: slot.num_sl_pscch_rbs,
            kind: SlVarTtiType::Ctrl,
        });
        tx.pscch_stats.push(SlPscchUeMacStat {
            sfn: slot.sfn,
            rnti: self.rnti,
            sym_start: slot.sl_pscch_sym_start,
            sym_length: slot.sl_pscch_sym_length,
            rb_start,
            rb_length: slot.num_sl_pscch_rbs,
            priority: slot.priority,
            mcs: slot.mcs,
            tb_size: grant.tb_size,
            rsvp_ms: grant.rri_ms,
            total_sub_channels: self.total_subchannels,
            sl_pssch_subch_start: slot.sl_pssch_subch_start,
            sl_pssch_subch_length: slot.sl_pssch_subch_length,
            sl_max_num_per_reserve: slot.max_num_per_reserve,
            gap_re_tx1: sci.gap_re_tx1(),
            gap_re_tx2: sci.gap_re_tx2(),
        });
        let encoded = sci.encode()?;
        debug!("Sending PSCCH to {} HARQ ID {}", slot.dst_l2_id, grant.harq_id);
        trace!("SCI 1-A: {}", bytes_to_hex(&encoded));
        tx.pscch.push(encoded);
        Ok(())
    }
}

impl MacCore {
    /// Transmission step of a sidelink slot
    fn transmit(&mut self, sfn: &SfnSf) -> Result<NrSlSlotTransmission, LayerError> {
        let ctx = TxContext {
            sfn: *sfn,
            rnti: self.rnti,
            src_l2_id: self.src_l2_id,
            subchannel_size: self.pool.subchannel_size(),
            total_subchannels: self.pool.total_subchannels(),
            psfch_period: self.pool.psfch_period(),
        };
        let mut tx = NrSlSlotTransmission::new(*sfn);
        if self.pool.slot_has_psfch(sfn.normalize()) {
            trace!("Slot {} has PSFCH", sfn);
            tx.var_tti_allocs.push(SlVarTtiAllocInfo {
                sym_start: PSFCH_SYMBOL,
                sym_length: 1,
                rb_start: 0,
                rb_length: ctx.total_subchannels * ctx.subchannel_size,
                kind: SlVarTtiType::Feedback,
            });
        }

        let Self { grants, harq, stats, .. } = &mut *self;
        for (dst_l2_id, dst_grants) in grants.iter_mut() {
            let mut index = 0;
            while index < dst_grants.len() {
                let grant = &mut dst_grants[index];
                grant.slot_allocations.remove_before(sfn);
                let Some(slot) = grant.slot_allocations.first().cloned() else {
                    debug!("No slot allocations remain for grant to {}", dst_l2_id);
                    dst_grants.remove(index);
                    continue;
                };
                if slot.sfn.normalize() != sfn.normalize() {
                    index += 1;
                    continue;
                }

                let burst: Vec<Bytes> = harq
                    .packet_burst(*dst_l2_id, grant.harq_id)
                    .map(<[Bytes]>::to_vec)
                    .unwrap_or_default();
                if burst.is_empty() && slot.ndi == 1 {
                    debug!("Wasted grant opportunity to {} at {}", dst_l2_id, sfn);
                    stats.wasted_grants += 1;
                    dst_grants.remove(index);
                    continue;
                }

                grant.tb_tx_counter += 1;
                grant.slot_allocations.pop_first();
                let done = grant.tb_tx_counter >= grant.n_selected || grant.slot_allocations.is_empty();

                if burst.is_empty() {
                    debug!("Wasted retransmission opportunity to {} at {}", dst_l2_id, sfn);
                    stats.wasted_retransmissions += 1;
                } else {
                    if slot.ndi == 1 {
                        stats.new_transmissions += 1;
                        stats.bytes_sent += burst.iter().map(|p| p.len() as u64).sum::<u64>();
                    } else {
                        stats.retransmissions += 1;
                    }
                    debug!(
                        "Sending PSSCH to {} HARQ ID {} ndi {} rv {}: {} PDUs",
                        dst_l2_id,
                        grant.harq_id,
                        slot.ndi,
                        slot.rv,
                        burst.len()
                    );
                    ctx.pssch(grant, &slot, burst, &mut tx);
                    if slot.tx_sci1a {
                        ctx.pscch(grant, &slot, &mut tx)?;
                        stats.pscch_transmissions += 1;
                    }
                }

                if done {
                    dst_grants.remove(index);
                } else {
                    index += 1;
                }
            }
        }

        if tx.has_data() {
            trace!("Adding {} to transmit history", sfn);
            self.transmit_history.push(*sfn);
        }
        Ok(tx)
    }
}

/// Slots from `now` to a later transmission, as carried by SCI 1-A
fn retx_gap(now: u64, next: &SfnSf) -> Result<u8, LayerError> {
    let gap = next.normalize().saturating_sub(now);
    u8::try_from(gap).map_err(|_| {
        LayerError::InvalidState(format!("Retransmission at {} is {} slots away, beyond SCI 1-A range", next, gap))
    })
}

/// Sidelink UE MAC entity
pub struct NrSlUeMac {
    core: MacCore,
    scheduler: Box<dyn NrSlUeMacScheduler>,
    /// Transmit destinations with their most important LC priority, sorted
    tx_destinations: Vec<(u32, u8)>,
    rx_destinations: BTreeSet<u32>,
    /// Last new data indicator seen per (source id, HARQ id), true once delivered
    rx_harq: BTreeMap<(u8, u8), bool>,
}

impl NrSlUeMac {
    pub fn new(
        rnti: u16,
        src_l2_id: u32,
        config: NrSlUeMacConfig,
        pool: Box<dyn SlResourcePool>,
        scheduler: Box<dyn NrSlUeMacScheduler>,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        let harq = NrSlUeMacHarq::new(config.num_harq_processes, config.num_harq_processes_multiple_pdu)?;
        info!(
            "Sidelink UE MAC RNTI {} source {}: {} subchannels of {} RBs, sensing {}",
            rnti,
            src_l2_id,
            pool.total_subchannels(),
            pool.subchannel_size(),
            config.enable_sensing
        );
        Ok(Self {
            core: MacCore {
                rnti,
                src_l2_id,
                generator: CandidateResourceGenerator::new(config.sensing_config()),
                config,
                pool,
                sensing_data: Vec::new(),
                transmit_history: Vec::new(),
                harq,
                grants: BTreeMap::new(),
                pending_tx_opps: VecDeque::new(),
                lcs: BTreeMap::new(),
                last_sensing_report: None,
                stats: NrSlUeMacStats::default(),
            },
            scheduler,
            tx_destinations: Vec::new(),
            rx_destinations: BTreeSet::new(),
            rx_harq: BTreeMap::new(),
        })
    }

    pub fn rnti(&self) -> u16 {
        self.core.rnti
    }

    pub fn src_l2_id(&self) -> u32 {
        self.core.src_l2_id
    }

    pub fn config(&self) -> &NrSlUeMacConfig {
        &self.core.config
    }

    pub fn stats(&self) -> &NrSlUeMacStats {
        &self.core.stats
    }

    pub fn harq(&self) -> &NrSlUeMacHarq {
        &self.core.harq
    }

    pub fn scheduler(&self) -> &dyn NrSlUeMacScheduler {
        &*self.scheduler
    }

    /// Grants published to the MAC and not yet consumed
    pub fn grants_of(&self, dst_l2_id: u32) -> &[NrSlGrant] {
        self.core.grants.get(&dst_l2_id).map_or(&[], |g| g.as_slice())
    }

    pub fn sensing_data(&self) -> &[SensingData] {
        &self.core.sensing_data
    }

    pub fn transmit_history(&self) -> &[SfnSf] {
        &self.core.transmit_history
    }

    /// Trace of the last candidate query
    pub fn last_sensing_report(&self) -> Option<&SensingTraceReport> {
        self.core.last_sensing_report.as_ref()
    }

    pub fn tx_destinations(&self) -> &[(u32, u8)] {
        &self.tx_destinations
    }

    /// Re-seed the scheduler random streams
    pub fn assign_streams(&mut self, seed: u64) -> u64 {
        self.scheduler.assign_streams(seed)
    }

    /// Configure a logical channel; own-source LCs are handed to the scheduler
    pub fn add_lc(&mut self, info: SidelinkLogicalChannelInfo) -> Result<(), LayerError> {
        let key = SidelinkLcIdentifier::new(info.src_l2_id, info.dst_l2_id, info.lc_id);
        if self.core.lcs.contains_key(&key) {
            return Err(LayerError::DuplicateLogicalChannel { dst: info.dst_l2_id, lcid: info.lc_id });
        }
        info!(
            "Adding LC {} from {} to {}, dynamic {}, PDB {} ms",
            info.lc_id, info.src_l2_id, info.dst_l2_id, info.dynamic, info.pdb_ms
        );
        if info.src_l2_id == self.core.src_l2_id {
            self.scheduler.csched_lc_config_req(&info)?;
            self.add_tx_destination(info.dst_l2_id, info.priority);
            if !self.core.harq.has_dst(info.dst_l2_id) {
                self.core.harq.add_dst(info.dst_l2_id)?;
            }
        }
        self.core.lcs.insert(key, info);
        Ok(())
    }

    /// Remove a data radio bearer LC
    pub fn remove_lc(&mut self, lcid: u8, src_l2_id: u32, dst_l2_id: u32) -> Result<(), LayerError> {
        if lcid <= MAX_SRB_LCID {
            return Err(LayerError::InvalidConfiguration(format!(
                "Only data radio bearer LCs can be removed, got LC {}",
                lcid
            )));
        }
        let key = SidelinkLcIdentifier::new(src_l2_id, dst_l2_id, lcid);
        if self.core.lcs.remove(&key).is_none() {
            return Err(LayerError::UnknownLogicalChannel { dst: dst_l2_id, lcid });
        }
        if src_l2_id == self.core.src_l2_id {
            self.scheduler.remove_lc_config_req(lcid, dst_l2_id);
        }
        debug!("Removed LC {} from {} to {}", lcid, src_l2_id, dst_l2_id);
        Ok(())
    }

    fn add_tx_destination(&mut self, dst_l2_id: u32, priority: u8) {
        match self.tx_destinations.iter_mut().find(|(dst, _)| *dst == dst_l2_id) {
            Some(entry) => entry.1 = entry.1.min(priority),
            None => {
                info!("Adding destination {} with priority {} to sidelink TX destinations", dst_l2_id, priority);
                self.tx_destinations.push((dst_l2_id, priority));
            }
        }
        self.tx_destinations.sort_by_key(|(_, priority)| *priority);
    }

    pub fn add_rx_destination(&mut self, dst_l2_id: u32) {
        info!("Adding destination {} to sidelink RX destinations", dst_l2_id);
        self.rx_destinations.insert(dst_l2_id);
    }

    pub fn remove_rx_destination(&mut self, dst_l2_id: u32) {
        self.rx_destinations.remove(&dst_l2_id);
    }

    /// Buffer status report from an RLC entity
    pub fn report_buffer_status(&mut self, params: &NrSlReportBufferStatus) -> Result<(), LayerError> {
        trace!(
            "Buffer status of LC {} to {}: {} bytes",
            params.lcid,
            params.dst_l2_id,
            params.tx_queue_size
        );
        self.scheduler.sched_rlc_buffer_req(params)
    }

    /// Sensing record of a decoded SCI 1-A, kept only with sensing enabled
    pub fn receive_sensing_data(&mut self, data: SensingData) {
        if self.core.config.enable_sensing {
            self.core.sensing_data.push(data);
        }
    }

    /// Build a sensing record from an SCI 1-A received at `sfn`
    pub fn receive_pscch(&mut self, sfn: SfnSf, sci1a: &[u8], rsrp_dbm: f64) -> Result<(), LayerError> {
        let sci = SciStage1A::decode(sci1a)?;
        let mut data = SensingData::new(
            sfn,
            sci.sl_resource_reserve_period,
            sci.length_subchannel,
            sci.index_start_subchannel,
            sci.priority,
            rsrp_dbm,
        );
        if sci.gap_re_tx1() != NO_VALUE {
            data = data.with_re_tx1(sci.gap_re_tx1(), sci.index_start_subchannel_re_tx1());
        }
        if sci.gap_re_tx2() != NO_VALUE {
            data = data.with_re_tx2(sci.gap_re_tx2(), sci.index_start_subchannel_re_tx2());
        }
        trace!("Sensed {}", data);
        self.receive_sensing_data(data);
        Ok(())
    }

    /// HARQ feedback received on PSFCH
    pub fn receive_psfch(&mut self, feedback: &SlHarqInfo) {
        if feedback.tx_rnti != self.core.rnti {
            return;
        }
        let removed = self.core.harq.recv_feedback(feedback);
        if !feedback.is_received_ok() {
            return;
        }
        self.core.stats.acks_received += 1;
        if !removed {
            return;
        }
        if let Some(grants) = self.core.grants.get_mut(&feedback.dst_l2_id) {
            if let Some(index) = grants.iter().position(|g| g.harq_id == feedback.harq_process_id) {
                info!(
                    "HARQ ACK: erasing grant to {} with HARQ ID {}",
                    feedback.dst_l2_id, feedback.harq_process_id
                );
                grants.remove(index);
            }
        }
    }

    /// PSSCH received from a peer, delivered to the RLC
    pub fn receive_pssch(
        &mut self,
        tx_rnti: u16,
        pssch: &SlPsschTransmission,
        rlc: &mut dyn NrSlMacSapUser,
    ) -> Result<PsschReception, LayerError> {
        let sci = SciStage2A::decode(&pssch.sci2a)?;
        let dst_l2_id = self
            .rx_destinations
            .iter()
            .copied()
            .find(|dst| L2Id::new(*dst).lsb16() == sci.dst_id)
            .ok_or(LayerError::UnknownDestination(sci.dst_id as u32))?;
        let feedback = sci.harq_feedback_indicator.then_some(SlHarqInfo {
            tx_rnti,
            dst_l2_id,
            harq_process_id: sci.harq_id,
            ack: true,
        });

        let delivered_before = self.rx_harq.entry((sci.src_id, sci.harq_id)).or_insert(false);
        if sci.ndi == 1 {
            *delivered_before = false;
        }
        if *delivered_before {
            trace!("TB of HARQ ID {} from {} already delivered", sci.harq_id, sci.src_id);
            return Ok(PsschReception { delivered: 0, feedback });
        }
        *delivered_before = true;

        let mut delivered = 0;
        for pdu in &pssch.pdus {
            for sdu in decode_sub_pdus(pdu)? {
                debug!(
                    "SL PDU reception on LC {} from {} to {}: {} bytes",
                    sdu.subheader.lcid,
                    sci.src_id,
                    dst_l2_id,
                    sdu.data.len()
                );
                rlc.receive_rlc_pdu(NrSlRlcPdu {
                    pdu: sdu.data,
                    rnti: self.core.rnti,
                    lcid: sdu.subheader.lcid,
                    harq_id: sci.harq_id,
                    src_l2_id: sci.src_id as u32,
                    dst_l2_id,
                });
                delivered += 1;
            }
        }
        Ok(PsschReception { delivered, feedback })
    }

    /// Slot boundary: schedule, serve the RLC, then transmit on sidelink slots
    pub fn slot_indication(
        &mut self,
        sfn: &SfnSf,
        rlc: &mut dyn NrSlMacSapUser,
    ) -> Result<Option<NrSlSlotTransmission>, LayerError> {
        trace!("Slot indication {} ({})", sfn, sfn.normalize());
        let window = self.core.pool.sensing_window_slots(sfn.numerology());
        if self.core.config.enable_sensing {
            remove_old_sensing_data(sfn, window, &mut self.core.sensing_data);
        }
        remove_old_transmit_history(sfn, window, &mut self.core.transmit_history);

        for (dst_l2_id, harq_id) in self.core.harq.expire(sfn.normalize()) {
            if self.core.harq.is_available(dst_l2_id, harq_id) {
                if let Some(grants) = self.core.grants.get_mut(&dst_l2_id) {
                    grants.retain(|g| g.harq_id != harq_id);
                }
            }
        }

        self.scheduler.sched_trigger_req(sfn, &mut self.core)?;
        self.deliver_tx_opportunities(rlc)?;

        if self.core.pool.is_sidelink_slot(sfn.normalize()) {
            Ok(Some(self.core.transmit(sfn)?))
        } else {
            Ok(None)
        }
    }

    /// Hand queued opportunities to the RLC and buffer its PDUs in HARQ
    fn deliver_tx_opportunities(&mut self, rlc: &mut dyn NrSlMacSapUser) -> Result<(), LayerError> {
        while let Some(opportunity) = self.core.pending_tx_opps.pop_front() {
            let pdus = rlc.notify_tx_opportunity(&opportunity);
            if pdus.is_empty() {
                debug!("RLC of LC {} to {} had nothing to send", opportunity.lcid, opportunity.dst_l2_id);
                continue;
            }
            let mut dequeued = 0u32;
            let mut sdus = Vec::with_capacity(pdus.len());
            for pdu in pdus {
                dequeued += pdu.pdu.len() as u32;
                sdus.push(MacSdu::new(opportunity.lcid, pdu.pdu)?);
            }
            if dequeued > opportunity.bytes {
                warn!(
                    "RLC of LC {} returned {} bytes for an opportunity of {}",
                    opportunity.lcid, dequeued, opportunity.bytes
                );
            }
            debug!(
                "Adding {} bytes of LC {} to HARQ ID {} of {}",
                dequeued, opportunity.lcid, opportunity.harq_id, opportunity.dst_l2_id
            );
            self.core.harq.add_packet(
                opportunity.dst_l2_id,
                opportunity.lcid,
                opportunity.harq_id,
                encode_sub_pdus(&sdus),
            )?;
            self.scheduler
                .notify_pdu_dequeue(opportunity.dst_l2_id, opportunity.lcid, dequeued)?;
        }
        Ok(())
    }
}
