//! Sidelink PHY/MAC Common Structures
//!
//! Resource, grant and sensing records exchanged between the sidelink MAC,
//! its scheduler and the PHY (3GPP TS 38.214 Section 8.1, TS 38.321 Section 5.22).

use bytes::Bytes;
use common::{CastType, SfnSf, SlotKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Marker for an absent retransmission gap or subchannel
pub const NO_VALUE: u8 = u8::MAX;

/// RLC PDU size reserved for one logical channel in a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlRlcPduInfo {
    /// Logical channel id
    pub lcid: u8,
    /// Bytes allocated to this LC
    pub size: u32,
}

impl SlRlcPduInfo {
    pub fn new(lcid: u8, size: u32) -> Self {
        Self { lcid, size }
    }
}

/// Single-slot candidate resource (TS 38.214 Section 8.1.4, R_x,y).
///
/// Candidates are created by the candidate generator and never mutated
/// afterwards. Lists of candidates are kept in slot order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlResourceInfo {
    /// Number of PRBs for PSCCH
    pub num_sl_pscch_rbs: u16,
    /// PSCCH starting symbol
    pub sl_pscch_sym_start: u16,
    /// PSCCH number of symbols
    pub sl_pscch_sym_length: u16,
    /// PSSCH starting symbol
    pub sl_pssch_sym_start: u16,
    /// PSSCH number of symbols
    pub sl_pssch_sym_length: u16,
    /// Subchannel size in RBs
    pub sl_subchannel_size: u16,
    /// Maximum number of reserved PSCCH/PSSCH resources indicated by one SCI
    pub sl_max_num_per_reserve: u16,
    /// PSFCH period of the pool in slots
    pub sl_psfch_period: u8,
    /// Minimum gap between PSSCH and its PSFCH, in slots
    pub sl_min_time_gap_psfch: u8,
    /// MAC processing gap after a PSFCH, in slots
    pub sl_min_time_gap_processing: u8,
    /// Slot of the resource
    pub sfn: SfnSf,
    /// First subchannel of the resource
    pub sl_subchannel_start: u8,
    /// Number of contiguous subchannels
    pub sl_subchannel_length: u8,
}

impl SlResourceInfo {
    /// Sort a candidate list by slot
    pub fn sort_by_slot(list: &mut [SlResourceInfo]) {
        list.sort_by_key(|r| r.sfn.key());
    }

    /// Whether two resources share a slot
    pub fn same_slot(&self, other: &SlResourceInfo) -> bool {
        self.sfn.key() == other.sfn.key()
    }
}

/// One slot of a grant, i.e. one (re)transmission opportunity
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SlGrantResource {
    /// Slot of the transmission
    pub sfn: SfnSf,
    /// Destination L2 id
    pub dst_l2_id: u32,
    /// New data indicator, 1 only for the first transmission of a TB
    pub ndi: u8,
    /// Redundancy version
    pub rv: u8,
    /// LC priority
    pub priority: u8,
    /// Bytes per LC carried in this transmission
    pub sl_rlc_pdu_info: Vec<SlRlcPduInfo>,
    /// MCS
    pub mcs: u8,
    /// Number of PRBs for PSCCH
    pub num_sl_pscch_rbs: u16,
    /// PSCCH starting symbol
    pub sl_pscch_sym_start: u16,
    /// PSCCH number of symbols
    pub sl_pscch_sym_length: u16,
    /// PSSCH starting symbol
    pub sl_pssch_sym_start: u16,
    /// PSSCH number of symbols
    pub sl_pssch_sym_length: u16,
    /// First PSSCH subchannel
    pub sl_pssch_subch_start: u16,
    /// Number of PSSCH subchannels
    pub sl_pssch_subch_length: u16,
    /// Maximum number of reserved resources indicated by one SCI 1-A
    pub max_num_per_reserve: u16,
    /// PSFCH present in the slot
    pub sl_has_psfch: bool,
    /// This slot carries an SCI 1-A
    pub tx_sci1a: bool,
    /// Number of transmissions the SCI 1-A of this slot indicates
    pub slot_num_ind: u8,
}

/// Slot-ordered set of grant resources.
///
/// Keyed by [`SlotKey`]: a second resource for an occupied slot is
/// rejected, so a grant never holds two transmissions in the same slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantSlots {
    slots: BTreeMap<SlotKey, SlGrantResource>,
}

impl GrantSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource, returning false when its slot is already taken
    pub fn insert(&mut self, resource: SlGrantResource) -> bool {
        let key = resource.sfn.key();
        if self.slots.contains_key(&key) {
            return false;
        }
        self.slots.insert(key, resource);
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Earliest resource
    pub fn first(&self) -> Option<&SlGrantResource> {
        self.slots.values().next()
    }

    /// Latest resource
    pub fn last(&self) -> Option<&SlGrantResource> {
        self.slots.values().next_back()
    }

    /// Remove and return the earliest resource
    pub fn pop_first(&mut self) -> Option<SlGrantResource> {
        self.slots.pop_first().map(|(_, r)| r)
    }

    /// Resources in slot order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SlGrantResource> {
        self.slots.values()
    }

    /// Mutable resources in slot order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SlGrantResource> {
        self.slots.values_mut()
    }

    /// Drop every resource strictly before `sfn`
    pub fn remove_before(&mut self, sfn: &SfnSf) {
        let key = sfn.key();
        self.slots.retain(|k, _| *k >= key);
    }
}

impl Serialize for GrantSlots {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.slots.values())
    }
}

impl FromIterator<SlGrantResource> for GrantSlots {
    fn from_iter<I: IntoIterator<Item = SlGrantResource>>(iter: I) -> Self {
        let mut slots = GrantSlots::new();
        for r in iter {
            slots.insert(r);
        }
        slots
    }
}

/// SCI reception reported by the PHY for sensing-based selection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensingData {
    /// Slot where the SCI was received
    pub sfn: SfnSf,
    /// Resource reservation period in ms
    pub rsvp: u16,
    /// Number of subchannels of the reservation
    pub sb_ch_length: u8,
    /// First subchannel of the reservation
    pub sb_ch_start: u8,
    /// Priority
    pub prio: u8,
    /// Measured RSRP in dBm
    pub sl_rsrp: f64,
    /// Gap to the first retransmission in slots, [`NO_VALUE`] when absent
    pub gap_re_tx1: u8,
    /// First subchannel of the first retransmission
    pub sb_ch_start_re_tx1: u8,
    /// Gap to the second retransmission in slots, [`NO_VALUE`] when absent
    pub gap_re_tx2: u8,
    /// First subchannel of the second retransmission
    pub sb_ch_start_re_tx2: u8,
}

impl SensingData {
    /// Sensing record without retransmission reservations
    pub fn new(sfn: SfnSf, rsvp: u16, sb_ch_length: u8, sb_ch_start: u8, prio: u8, sl_rsrp: f64) -> Self {
        Self {
            sfn,
            rsvp,
            sb_ch_length,
            sb_ch_start,
            prio,
            sl_rsrp,
            gap_re_tx1: NO_VALUE,
            sb_ch_start_re_tx1: NO_VALUE,
            gap_re_tx2: NO_VALUE,
            sb_ch_start_re_tx2: NO_VALUE,
        }
    }

    /// Add the first retransmission reservation
    pub fn with_re_tx1(mut self, gap: u8, sb_ch_start: u8) -> Self {
        self.gap_re_tx1 = gap;
        self.sb_ch_start_re_tx1 = sb_ch_start;
        self
    }

    /// Add the second retransmission reservation
    pub fn with_re_tx2(mut self, gap: u8, sb_ch_start: u8) -> Self {
        self.gap_re_tx2 = gap;
        self.sb_ch_start_re_tx2 = sb_ch_start;
        self
    }
}

impl fmt::Display for SensingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sfn: {}, rsvp: {}, sbChLength: {}, sbChStart: {}, prio: {}, rsrp: {:.2}, gapReTx1: {}, sbChStartReTx1: {}, gapReTx2: {}, sbChStartReTx2: {}",
            self.sfn,
            self.rsvp,
            self.sb_ch_length,
            self.sb_ch_start,
            self.prio,
            self.sl_rsrp,
            self.gap_re_tx1,
            self.sb_ch_start_re_tx1,
            self.gap_re_tx2,
            self.sb_ch_start_re_tx2
        )
    }
}

/// Future reservation projected from a sensed SCI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservedResource {
    pub sfn: SfnSf,
    pub rsvp: u16,
    pub sb_ch_length: u8,
    pub sb_ch_start: u8,
    pub prio: u8,
    pub sl_rsrp: f64,
}

/// Kind of a sidelink variable TTI allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SlVarTtiType {
    Ctrl,
    Data,
    Feedback,
}

/// Symbol/RB allocation handed to the PHY for one slot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SlVarTtiAllocInfo {
    pub sym_start: u16,
    pub sym_length: u16,
    pub rb_start: u16,
    pub rb_length: u16,
    pub kind: SlVarTtiType,
}

/// HARQ feedback received on PSFCH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlHarqInfo {
    /// Transmitting RNTI of the feedback
    pub tx_rnti: u16,
    /// Destination L2 id the TB was sent to
    pub dst_l2_id: u32,
    /// HARQ process id
    pub harq_process_id: u8,
    /// Positive acknowledgement
    pub ack: bool,
}

impl SlHarqInfo {
    pub fn is_received_ok(&self) -> bool {
        self.ack
    }
}

/// Grant handed by the scheduler to the MAC
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NrSlGrant {
    /// All (re)transmission slots, in slot order
    pub slot_allocations: GrantSlots,
    /// HARQ feedback enabled for the grant
    pub harq_enabled: bool,
    /// HARQ process id
    pub harq_id: u8,
    /// Number of slots selected for one reservation period
    pub n_selected: u8,
    /// Transmissions of the current TB in this reservation period
    pub tb_tx_counter: u8,
    /// Transport block size in bytes
    pub tb_size: u32,
    /// Resource reservation interval in ms, 0 for dynamic grants
    pub rri_ms: u16,
    /// Cast type
    pub cast_type: CastType,
}

/// Parameters of a candidate resource query (TS 38.214 Section 8.1.4)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NrSlTransmissionParams {
    /// L1 priority prio_TX
    pub priority: u8,
    /// Remaining packet delay budget in ms, 0 when unset
    pub pdb_ms: u32,
    /// Number of subchannels L_subCH
    pub l_subch: u16,
    /// Resource reservation interval P_rsvp_TX in ms
    pub rri_ms: u16,
    /// C_resel counter
    pub c_resel: u16,
}

impl fmt::Display for NrSlTransmissionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Prio: {}, PDB: {} ms, LSubCh: {}, RRI: {} ms, CResel: {}",
            self.priority, self.pdb_ms, self.l_subch, self.rri_ms, self.c_resel
        )
    }
}

/// Summary of one run of the sensing-based selection algorithm
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensingTraceReport {
    pub sfn: SfnSf,
    pub t0: u16,
    pub tproc0: u8,
    pub t1: u8,
    pub t2: u16,
    pub subchannels: u16,
    pub l_subch: u16,
    pub resource_percentage: u8,
    pub initial_candidate_slots_size: u16,
    pub initial_candidate_resources_size: u16,
    pub candidate_resources_size_after_step5: u16,
    pub initial_rsrp_threshold: i32,
    pub final_rsrp_threshold: i32,
}

/// Sidelink logical channel configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SidelinkLogicalChannelInfo {
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
    pub lc_id: u8,
    pub lc_group: u8,
    /// PC5 QoS identifier
    pub pqi: u8,
    /// Priority, lower value is more important on air but the scheduler
    /// serves the highest configured value first
    pub priority: u8,
    pub is_gbr: bool,
    /// Maximum bit rate
    pub mbr: u64,
    /// Guaranteed bit rate
    pub gbr: u64,
    pub cast_type: CastType,
    pub harq_enabled: bool,
    /// Packet delay budget in ms, 0 when unset
    pub pdb_ms: u32,
    /// Dynamic grant (true) or semi-persistent grant (false)
    pub dynamic: bool,
    /// Resource reservation interval in ms for SPS
    pub rri_ms: u16,
}

/// Buffer status reported by an RLC entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NrSlReportBufferStatus {
    pub rnti: u16,
    pub lcid: u8,
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
    /// Bytes waiting for transmission
    pub tx_queue_size: u32,
    /// Head-of-line delay of the transmission queue in ms
    pub tx_queue_hol_delay: u16,
    /// Bytes waiting for retransmission
    pub retx_queue_size: u32,
    /// Head-of-line delay of the retransmission queue in ms
    pub retx_queue_hol_delay: u16,
    /// Size of a pending status PDU
    pub status_pdu_size: u16,
}

/// Transmit opportunity offered to an RLC entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NrSlTxOpportunity {
    pub bytes: u32,
    pub rnti: u16,
    pub lcid: u8,
    pub harq_id: u8,
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
}

/// RLC PDU returned for a transmit opportunity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NrSlRlcPdu {
    pub pdu: Bytes,
    pub rnti: u16,
    pub lcid: u8,
    pub harq_id: u8,
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
}

/// Key of a sidelink logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SidelinkLcIdentifier {
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
    pub lcid: u8,
}

impl SidelinkLcIdentifier {
    pub fn new(src_l2_id: u32, dst_l2_id: u32, lcid: u8) -> Self {
        Self { src_l2_id, dst_l2_id, lcid }
    }
}

/// PSCCH scheduling record for one transmitted SCI 1-A
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlPscchUeMacStat {
    pub sfn: SfnSf,
    pub rnti: u16,
    pub sym_start: u16,
    pub sym_length: u16,
    pub rb_start: u16,
    pub rb_length: u16,
    pub priority: u8,
    pub mcs: u8,
    pub tb_size: u32,
    pub rsvp_ms: u16,
    pub total_sub_channels: u16,
    pub sl_pssch_subch_start: u16,
    pub sl_pssch_subch_length: u16,
    pub sl_max_num_per_reserve: u16,
    pub gap_re_tx1: u8,
    pub gap_re_tx2: u8,
}

/// PSSCH scheduling record for one transmitted TB
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlPsschUeMacStat {
    pub sfn: SfnSf,
    pub rnti: u16,
    pub sym_start: u16,
    pub sym_length: u16,
    pub sub_channel_size: u16,
    pub rb_start: u16,
    pub rb_length: u16,
    pub harq_id: u8,
    pub ndi: u8,
    pub rv: u8,
    pub src_l2_id: u32,
    pub dst_l2_id: u32,
    pub csi_req: u8,
    pub cast_type: CastType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(slot: u64) -> SlGrantResource {
        SlGrantResource {
            sfn: SfnSf::from_normalized(slot, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_grant_slots_reject_same_slot() {
        let mut slots = GrantSlots::new();
        assert!(slots.insert(resource(10)));
        assert!(!slots.insert(resource(10)));
        assert!(slots.insert(resource(4)));
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.first().unwrap().sfn.normalize(), 4);
        assert_eq!(slots.last().unwrap().sfn.normalize(), 10);
    }

    #[test]
    fn test_grant_slots_remove_before() {
        let mut slots: GrantSlots = [3, 5, 9].into_iter().map(resource).collect();
        slots.remove_before(&SfnSf::from_normalized(5, 0).unwrap());
        let left: Vec<u64> = slots.iter().map(|r| r.sfn.normalize()).collect();
        assert_eq!(left, vec![5, 9]);
    }

    #[test]
    fn test_sensing_data_builder() {
        let sfn = SfnSf::new(1, 2, 0, 0).unwrap();
        let data = SensingData::new(sfn, 100, 2, 0, 1, -90.0).with_re_tx1(4, 3);
        assert_eq!(data.gap_re_tx1, 4);
        assert_eq!(data.gap_re_tx2, NO_VALUE);
    }
}
