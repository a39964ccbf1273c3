//! Scheduler Logical Channel Bookkeeping
//!
//! Per-destination logical channel groups and buffer accounting used by the
//! sidelink UE schedulers (3GPP TS 38.321 Section 5.22.1.4).

use crate::LayerError;
use common::CastType;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::phy_mac_common::{NrSlReportBufferStatus, SidelinkLogicalChannelInfo};

/// Scheduler view of one sidelink logical channel
#[derive(Debug, Clone, PartialEq)]
pub struct SlLogicalChannel {
    pub id: u8,
    pub pqi: u8,
    pub priority: u8,
    pub is_gbr: bool,
    pub mbr: u64,
    pub gbr: u64,
    pub harq_enabled: bool,
    pub pdb_ms: u32,
    pub dynamic: bool,
    pub rri_ms: u16,
    pub cast_type: CastType,
    /// Bytes in the RLC transmission queue
    pub tx_queue_size: u32,
    pub tx_queue_hol_delay: u16,
    /// Bytes in the RLC retransmission queue
    pub retx_queue_size: u32,
    pub retx_queue_hol_delay: u16,
    /// Size of a pending RLC status PDU
    pub status_pdu_size: u32,
}

impl SlLogicalChannel {
    pub fn new(conf: &SidelinkLogicalChannelInfo) -> Self {
        Self {
            id: conf.lc_id,
            pqi: conf.pqi,
            priority: conf.priority,
            is_gbr: conf.is_gbr,
            mbr: conf.mbr,
            gbr: conf.gbr,
            harq_enabled: conf.harq_enabled,
            pdb_ms: conf.pdb_ms,
            dynamic: conf.dynamic,
            rri_ms: conf.rri_ms,
            cast_type: conf.cast_type,
            tx_queue_size: 0,
            tx_queue_hol_delay: 0,
            retx_queue_size: 0,
            retx_queue_hol_delay: 0,
            status_pdu_size: 0,
        }
    }

    /// Store a buffer status report, returning the change of the queued bytes
    pub fn update(&mut self, params: &NrSlReportBufferStatus) -> i64 {
        let delta = params.tx_queue_size as i64 - self.tx_queue_size as i64
            + params.retx_queue_size as i64
            - self.retx_queue_size as i64
            + params.status_pdu_size as i64
            - self.status_pdu_size as i64;
        self.tx_queue_size = params.tx_queue_size;
        self.tx_queue_hol_delay = params.tx_queue_hol_delay;
        self.retx_queue_size = params.retx_queue_size;
        self.retx_queue_hol_delay = params.retx_queue_hol_delay;
        self.status_pdu_size = params.status_pdu_size as u32;
        delta
    }

    /// Bytes queued in all RLC queues
    pub fn total_queue_size(&self) -> u32 {
        self.tx_queue_size + self.retx_queue_size + self.status_pdu_size
    }
}

/// Logical channel group of one destination
#[derive(Debug, Clone, PartialEq)]
pub struct SlLogicalChannelGroup {
    id: u8,
    lcs: BTreeMap<u8, SlLogicalChannel>,
    total_size: u32,
}

impl SlLogicalChannelGroup {
    pub fn new(id: u8) -> Self {
        Self { id, lcs: BTreeMap::new(), total_size: 0 }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn contains(&self, lcid: u8) -> bool {
        self.lcs.contains_key(&lcid)
    }

    pub fn num_of_lc(&self) -> usize {
        self.lcs.len()
    }

    /// Add a logical channel, rejecting a duplicate id
    pub fn insert(&mut self, lc: SlLogicalChannel, dst: u32) -> Result<(), LayerError> {
        if self.lcs.contains_key(&lc.id) {
            return Err(LayerError::DuplicateLogicalChannel { dst, lcid: lc.id });
        }
        self.lcs.insert(lc.id, lc);
        Ok(())
    }

    /// Remove a logical channel; unknown ids are ignored
    pub fn remove(&mut self, lcid: u8) {
        match self.lcs.remove(&lcid) {
            Some(lc) => {
                self.total_size = self.total_size.saturating_sub(lc.total_queue_size());
            }
            None => debug!("LCG {} does not contain LCID {}", self.id, lcid),
        }
    }

    /// Apply a buffer status report to its logical channel
    pub fn update_info(&mut self, params: &NrSlReportBufferStatus) -> Result<(), LayerError> {
        let lc = self
            .lcs
            .get_mut(&params.lcid)
            .ok_or(LayerError::UnknownLogicalChannel { dst: params.dst_l2_id, lcid: params.lcid })?;
        let delta = lc.update(params);
        let total = self.total_size as i64 + delta;
        if total < 0 {
            warn!("LCG {} total size {} would become negative by {}", self.id, self.total_size, delta);
        }
        self.total_size = total.max(0) as u32;
        Ok(())
    }

    /// Bytes queued in the whole group
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn total_size_of_lc(&self, lcid: u8) -> Option<u32> {
        self.lcs.get(&lcid).map(|lc| lc.total_queue_size())
    }

    pub fn lc_ids(&self) -> Vec<u8> {
        self.lcs.keys().copied().collect()
    }

    pub fn lc(&self, lcid: u8) -> Option<&SlLogicalChannel> {
        self.lcs.get(&lcid)
    }

    pub fn lcs(&self) -> impl Iterator<Item = &SlLogicalChannel> {
        self.lcs.values()
    }

    /// Account `size` bytes handed to the LC by a transmit opportunity.
    ///
    /// A pending status PDU is served first, then the retransmission queue,
    /// then the transmission queue.
    pub fn assigned_data(&mut self, lcid: u8, size: u32) -> Result<(), LayerError> {
        let id = self.id;
        let lc = self
            .lcs
            .get_mut(&lcid)
            .ok_or(LayerError::InvalidState(format!("LCG {} has no LCID {}", id, lcid)))?;
        debug!(
            "Assigning {} bytes to LCID {}: status PDU {}, retx queue {}, tx queue {}",
            size, lcid, lc.status_pdu_size, lc.retx_queue_size, lc.tx_queue_size
        );

        if lc.status_pdu_size > 0 && size >= lc.status_pdu_size {
            lc.status_pdu_size = 0;
        } else if lc.retx_queue_size > 0 && size >= lc.retx_queue_size {
            lc.retx_queue_size = 0;
        } else if lc.tx_queue_size > 0 {
            lc.tx_queue_size = lc.tx_queue_size.saturating_sub(size);
        }

        self.total_size = self.total_size.saturating_sub(size);
        Ok(())
    }
}

/// Scheduler state of one destination
#[derive(Debug, Clone, PartialEq)]
pub struct SlDestinationInfo {
    dst_l2_id: u32,
    mcs: u8,
    lcgs: BTreeMap<u8, SlLogicalChannelGroup>,
}

impl SlDestinationInfo {
    pub fn new(dst_l2_id: u32, mcs: u8) -> Self {
        Self { dst_l2_id, mcs, lcgs: BTreeMap::new() }
    }

    pub fn dst_l2_id(&self) -> u32 {
        self.dst_l2_id
    }

    pub fn mcs(&self) -> u8 {
        self.mcs
    }

    pub fn set_mcs(&mut self, mcs: u8) {
        self.mcs = mcs;
    }

    /// Group with the given id, created when missing
    pub fn lcg_or_insert(&mut self, lcg_id: u8) -> &mut SlLogicalChannelGroup {
        self.lcgs.entry(lcg_id).or_insert_with(|| SlLogicalChannelGroup::new(lcg_id))
    }

    pub fn lcgs(&self) -> &BTreeMap<u8, SlLogicalChannelGroup> {
        &self.lcgs
    }

    pub fn lcgs_mut(&mut self) -> &mut BTreeMap<u8, SlLogicalChannelGroup> {
        &mut self.lcgs
    }

    /// Group holding `lcid`
    pub fn lcg_of(&self, lcid: u8) -> Option<&SlLogicalChannelGroup> {
        self.lcgs.values().find(|lcg| lcg.contains(lcid))
    }

    /// Mutable group holding `lcid`
    pub fn lcg_of_mut(&mut self, lcid: u8) -> Option<&mut SlLogicalChannelGroup> {
        self.lcgs.values_mut().find(|lcg| lcg.contains(lcid))
    }

    /// Total number of logical channels over all groups
    pub fn num_of_lc(&self) -> usize {
        self.lcgs.values().map(|lcg| lcg.num_of_lc()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lc_info(dst: u32, lcid: u8, priority: u8, dynamic: bool) -> SidelinkLogicalChannelInfo {
        SidelinkLogicalChannelInfo {
            src_l2_id: 1,
            dst_l2_id: dst,
            lc_id: lcid,
            lc_group: 3,
            pqi: 23,
            priority,
            is_gbr: false,
            mbr: 0,
            gbr: 0,
            cast_type: CastType::Groupcast,
            harq_enabled: false,
            pdb_ms: 0,
            dynamic,
            rri_ms: if dynamic { 0 } else { 100 },
        }
    }

    fn bsr(dst: u32, lcid: u8, tx: u32) -> NrSlReportBufferStatus {
        NrSlReportBufferStatus { lcid, dst_l2_id: dst, tx_queue_size: tx, ..Default::default() }
    }

    #[test]
    fn test_lc_update_returns_delta() {
        let mut lc = SlLogicalChannel::new(&lc_info(5, 4, 1, true));
        assert_eq!(lc.update(&bsr(5, 4, 100)), 100);
        assert_eq!(lc.update(&bsr(5, 4, 40)), -60);
        assert_eq!(lc.total_queue_size(), 40);
    }

    #[test]
    fn test_lcg_accounting_reaches_zero() {
        let mut lcg = SlLogicalChannelGroup::new(3);
        lcg.insert(SlLogicalChannel::new(&lc_info(5, 4, 1, true)), 5).unwrap();
        lcg.update_info(&bsr(5, 4, 300)).unwrap();
        assert_eq!(lcg.total_size(), 300);
        lcg.assigned_data(4, 120).unwrap();
        assert_eq!(lcg.total_size(), 180);
        assert_eq!(lcg.total_size_of_lc(4), Some(180));
        lcg.assigned_data(4, 180).unwrap();
        assert_eq!(lcg.total_size(), 0);
        assert_eq!(lcg.total_size_of_lc(4), Some(0));
    }

    #[test]
    fn test_status_pdu_served_first() {
        let mut lcg = SlLogicalChannelGroup::new(3);
        lcg.insert(SlLogicalChannel::new(&lc_info(5, 4, 1, true)), 5).unwrap();
        let mut report = bsr(5, 4, 100);
        report.status_pdu_size = 10;
        lcg.update_info(&report).unwrap();
        lcg.assigned_data(4, 10).unwrap();
        let lc = lcg.lc(4).unwrap();
        assert_eq!(lc.status_pdu_size, 0);
        assert_eq!(lc.tx_queue_size, 100);
        assert_eq!(lcg.total_size(), 100);
    }

    #[test]
    fn test_duplicate_and_unknown_lc() {
        let mut lcg = SlLogicalChannelGroup::new(3);
        lcg.insert(SlLogicalChannel::new(&lc_info(5, 4, 1, true)), 5).unwrap();
        assert!(matches!(
            lcg.insert(SlLogicalChannel::new(&lc_info(5, 4, 1, true)), 5),
            Err(LayerError::DuplicateLogicalChannel { dst: 5, lcid: 4 })
        ));
        assert!(lcg.update_info(&bsr(5, 9, 10)).is_err());
        lcg.remove(9);
        lcg.remove(4);
        assert_eq!(lcg.num_of_lc(), 0);
    }

    #[test]
    fn test_destination_lookup() {
        let mut dst = SlDestinationInfo::new(5, 14);
        dst.lcg_or_insert(3).insert(SlLogicalChannel::new(&lc_info(5, 4, 1, true)), 5).unwrap();
        dst.lcg_or_insert(3).insert(SlLogicalChannel::new(&lc_info(5, 5, 2, true)), 5).unwrap();
        assert_eq!(dst.num_of_lc(), 2);
        assert_eq!(dst.lcg_of(5).unwrap().id(), 3);
        assert!(dst.lcg_of(6).is_none());
        assert_eq!(dst.mcs(), 14);
    }
}
