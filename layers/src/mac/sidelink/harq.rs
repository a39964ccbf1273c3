//! Sidelink HARQ Entity
//!
//! Transmitter-side sidelink HARQ process management according to
//! 3GPP TS 38.321 Section 5.22.1.3.

use crate::LayerError;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, trace};

use super::phy_mac_common::SlHarqInfo;

/// Largest number of processes addressable by the 5-bit HARQ id of SCI 2-A
pub const MAX_SL_HARQ_PROCESSES: u8 = 32;

/// One sidelink HARQ process
#[derive(Debug, Clone, Default)]
struct HarqProcess {
    /// Process is BUSY
    allocated: bool,
    /// Process serves a semi-persistent grant
    multiple_pdu: bool,
    /// Buffered MAC PDUs
    packets: Vec<Bytes>,
    /// LC ids of the buffered PDUs
    lcid_list: BTreeSet<u8>,
    /// Absolute slot index at which the process times out
    deadline: Option<u64>,
    /// Transmissions planned for the TB
    num_tx: u8,
    harq_enabled: bool,
    tb_size: u32,
}

impl HarqProcess {
    fn flush(&mut self) {
        self.packets.clear();
        self.lcid_list.clear();
    }

    fn reset(&mut self) {
        *self = HarqProcess::default();
    }
}

/// Process pool of one destination
#[derive(Debug, Clone)]
struct DstHarqPool {
    processes: Vec<HarqProcess>,
    free_ids: VecDeque<u8>,
    num_multiple_pdu: u8,
}

impl DstHarqPool {
    fn new(max_processes: u8) -> Self {
        Self {
            processes: vec![HarqProcess::default(); max_processes as usize],
            free_ids: (0..max_processes).collect(),
            num_multiple_pdu: 0,
        }
    }

    fn release(&mut self, id: u8) {
        let process = &mut self.processes[id as usize];
        if !process.allocated {
            return;
        }
        if process.multiple_pdu && self.num_multiple_pdu > 0 {
            self.num_multiple_pdu -= 1;
        }
        process.reset();
        self.free_ids.push_back(id);
    }
}

/// Sidelink HARQ entity holding a fixed-size process pool per destination
#[derive(Debug, Clone)]
pub struct NrSlUeMacHarq {
    max_processes: u8,
    max_processes_multiple_pdu: u8,
    pools: BTreeMap<u32, DstHarqPool>,
}

impl NrSlUeMacHarq {
    /// Create the HARQ entity
    pub fn new(max_processes: u8, max_processes_multiple_pdu: u8) -> Result<Self, LayerError> {
        if max_processes == 0 || max_processes > MAX_SL_HARQ_PROCESSES {
            return Err(LayerError::InvalidConfiguration(format!(
                "Number of sidelink HARQ processes {} outside 1..={}",
                max_processes, MAX_SL_HARQ_PROCESSES
            )));
        }
        if max_processes_multiple_pdu > max_processes {
            return Err(LayerError::InvalidConfiguration(format!(
                "Multiple-PDU processes {} exceed total processes {}",
                max_processes_multiple_pdu, max_processes
            )));
        }
        Ok(Self { max_processes, max_processes_multiple_pdu, pools: BTreeMap::new() })
    }

    /// (multiple-PDU processes, total processes) per destination
    pub fn num_sidelink_processes(&self) -> (u8, u8) {
        (self.max_processes_multiple_pdu, self.max_processes)
    }

    /// Create the process pool of a destination
    pub fn add_dst(&mut self, dst_l2_id: u32) -> Result<(), LayerError> {
        if self.pools.contains_key(&dst_l2_id) {
            return Err(LayerError::InvalidState(format!(
                "HARQ processes already exist for destination {}",
                dst_l2_id
            )));
        }
        info!("Adding {} HARQ processes for destination {}", self.max_processes, dst_l2_id);
        self.pools.insert(dst_l2_id, DstHarqPool::new(self.max_processes));
        Ok(())
    }

    pub fn has_dst(&self, dst_l2_id: u32) -> bool {
        self.pools.contains_key(&dst_l2_id)
    }

    /// Allocate a process that times out at `deadline_slot`.
    ///
    /// Returns `None` when the destination has no free process, or no free
    /// multiple-PDU process when one is requested.
    pub fn allocate(&mut self, dst_l2_id: u32, multiple_pdu: bool, deadline_slot: u64) -> Option<u8> {
        let max_multiple = self.max_processes_multiple_pdu;
        let Some(pool) = self.pools.get_mut(&dst_l2_id) else {
            debug!("No HARQ processes configured for destination {}", dst_l2_id);
            return None;
        };
        if pool.free_ids.is_empty() {
            info!("No HARQ process IDs available for {}", dst_l2_id);
            return None;
        }
        if multiple_pdu && pool.num_multiple_pdu == max_multiple {
            info!("No HARQ process IDs for multiple PDUs available for {}", dst_l2_id);
            return None;
        }
        let id = pool.free_ids.pop_front()?;
        if multiple_pdu {
            pool.num_multiple_pdu += 1;
        }
        let process = &mut pool.processes[id as usize];
        process.allocated = true;
        process.multiple_pdu = multiple_pdu;
        process.deadline = Some(deadline_slot);
        info!(
            "Allocating HARQ ID {} for destination {} until slot {}, multiple PDU {}, remaining {}",
            id,
            dst_l2_id,
            deadline_slot,
            multiple_pdu,
            pool.free_ids.len()
        );
        Some(id)
    }

    /// Assign a single-PDU process without a deadline
    pub fn assign(&mut self, dst_l2_id: u32) -> Result<u8, LayerError> {
        let pool = self
            .pools
            .get_mut(&dst_l2_id)
            .ok_or(LayerError::UnknownDestination(dst_l2_id))?;
        let id = pool
            .free_ids
            .pop_front()
            .ok_or(LayerError::HarqProcessUnavailable(dst_l2_id))?;
        pool.processes[id as usize].allocated = true;
        debug!("Assigned HARQ ID {} to destination {}", id, dst_l2_id);
        Ok(id)
    }

    /// Return a process to the free list
    pub fn deallocate(&mut self, dst_l2_id: u32, harq_id: u8) {
        if let Some(pool) = self.pools.get_mut(&dst_l2_id) {
            if (harq_id as usize) < pool.processes.len() && pool.processes[harq_id as usize].allocated {
                pool.release(harq_id);
                info!("Deallocating HARQ ID {} of {}, remaining {}", harq_id, dst_l2_id, pool.free_ids.len());
            }
        }
    }

    /// Move the deadline of a BUSY process; false when it is IDLE
    pub fn renew_timer(&mut self, dst_l2_id: u32, harq_id: u8, deadline_slot: u64) -> bool {
        match self.process_mut(dst_l2_id, harq_id) {
            Some(process) if process.allocated => {
                debug!("Renewing HARQ ID {} of {} until slot {}", harq_id, dst_l2_id, deadline_slot);
                process.deadline = Some(deadline_slot);
                true
            }
            _ => {
                debug!("HARQ ID {} of {} is not allocated; not renewing timer", harq_id, dst_l2_id);
                false
            }
        }
    }

    /// Free processes of a destination
    pub fn num_available(&self, dst_l2_id: u32) -> usize {
        self.pools.get(&dst_l2_id).map_or(0, |pool| pool.free_ids.len())
    }

    /// Free processes over all destinations
    pub fn num_available_total(&self) -> usize {
        self.pools.values().map(|pool| pool.free_ids.len()).sum()
    }

    /// Whether a process is IDLE
    pub fn is_available(&self, dst_l2_id: u32, harq_id: u8) -> bool {
        self.process(dst_l2_id, harq_id).is_some_and(|p| !p.allocated)
    }

    /// Buffer a MAC PDU on a BUSY process; IDLE processes ignore it
    pub fn add_packet(&mut self, dst_l2_id: u32, lcid: u8, harq_id: u8, pdu: Bytes) -> Result<(), LayerError> {
        if !self.pools.contains_key(&dst_l2_id) {
            return Err(LayerError::UnknownDestination(dst_l2_id));
        }
        let process = self.process_mut(dst_l2_id, harq_id).ok_or_else(|| {
            LayerError::InvalidState(format!("HARQ id {} does not belong to destination {}", harq_id, dst_l2_id))
        })?;
        if !process.allocated {
            debug!("Ignoring packet for IDLE HARQ ID {} of {}", harq_id, dst_l2_id);
            return Ok(());
        }
        if process.lcid_list.contains(&lcid) {
            return Err(LayerError::InvalidState(format!(
                "Mismatch in number of LCIDs and packets for HARQ ID {} destination {}",
                harq_id, dst_l2_id
            )));
        }
        trace!("Adding packet for destination {} LC ID {} HARQ ID {}", dst_l2_id, lcid, harq_id);
        process.lcid_list.insert(lcid);
        process.packets.push(pdu);
        Ok(())
    }

    /// Handle PSFCH feedback, returning true when the TB left the buffer
    pub fn recv_feedback(&mut self, feedback: &SlHarqInfo) -> bool {
        let Some(pool) = self.pools.get_mut(&feedback.dst_l2_id) else {
            debug!("Feedback received for unknown destination {}", feedback.dst_l2_id);
            return false;
        };
        let id = feedback.harq_process_id;
        let Some(process) = pool.processes.get_mut(id as usize) else {
            debug!("Feedback received for invalid HARQ ID {}", id);
            return false;
        };
        if !process.allocated {
            debug!("Feedback (possibly stale) received for unused HARQ ID {}", id);
            return false;
        }
        if !feedback.is_received_ok() || process.packets.is_empty() {
            return false;
        }
        if process.multiple_pdu {
            debug!("ACK on multiple-PDU HARQ ID {}, flushing buffer", id);
            process.flush();
        } else {
            pool.release(id);
            info!("ACK frees HARQ ID {} of {}, remaining {}", id, feedback.dst_l2_id, pool.free_ids.len());
        }
        true
    }

    /// Buffered PDUs of a BUSY process
    pub fn packet_burst(&self, dst_l2_id: u32, harq_id: u8) -> Option<&[Bytes]> {
        match self.process(dst_l2_id, harq_id) {
            Some(process) if process.allocated => Some(process.packets.as_slice()),
            _ => {
                debug!("No packet burst for destination {} HARQ ID {}", dst_l2_id, harq_id);
                None
            }
        }
    }

    /// Number of LC ids recorded on a process
    pub fn lcid_count(&self, dst_l2_id: u32, harq_id: u8) -> usize {
        self.process(dst_l2_id, harq_id).map_or(0, |p| p.lcid_list.len())
    }

    /// Drop the buffered PDUs of a process, keeping it allocated
    pub fn flush(&mut self, dst_l2_id: u32, harq_id: u8) {
        if let Some(process) = self.process_mut(dst_l2_id, harq_id) {
            debug!("Flush packet buffer for HARQ ID {}", harq_id);
            process.flush();
        }
    }

    /// Record the transmission parameters of the TB held by a process
    pub fn update_harq_process(&mut self, dst_l2_id: u32, harq_id: u8, num_tx: u8, harq_enabled: bool, tb_size: u32) {
        if let Some(process) = self.process_mut(dst_l2_id, harq_id) {
            process.num_tx = num_tx;
            process.harq_enabled = harq_enabled;
            process.tb_size = tb_size;
        }
    }

    /// (transmissions, HARQ enabled, TB size) recorded on a process
    pub fn harq_process_info(&self, dst_l2_id: u32, harq_id: u8) -> Option<(u8, bool, u32)> {
        self.process(dst_l2_id, harq_id).map(|p| (p.num_tx, p.harq_enabled, p.tb_size))
    }

    /// Apply every deadline reached at `now`.
    ///
    /// Single-PDU processes return to the free list, multiple-PDU processes
    /// only lose their buffer. Returns the affected (destination, id) pairs.
    pub fn expire(&mut self, now: u64) -> Vec<(u32, u8)> {
        let mut expired = Vec::new();
        for (dst, pool) in self.pools.iter_mut() {
            for id in 0..pool.processes.len() as u8 {
                let process = &mut pool.processes[id as usize];
                if !process.allocated || process.deadline.map_or(true, |d| d > now) {
                    continue;
                }
                info!("HARQ process ID {} of {} timed out", id, dst);
                if process.multiple_pdu {
                    process.flush();
                    process.deadline = None;
                } else {
                    pool.release(id);
                }
                expired.push((*dst, id));
            }
        }
        expired
    }

    fn process(&self, dst_l2_id: u32, harq_id: u8) -> Option<&HarqProcess> {
        self.pools.get(&dst_l2_id)?.processes.get(harq_id as usize)
    }

    fn process_mut(&mut self, dst_l2_id: u32, harq_id: u8) -> Option<&mut HarqProcess> {
        self.pools.get_mut(&dst_l2_id)?.processes.get_mut(harq_id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(dst: u32, id: u8) -> SlHarqInfo {
        SlHarqInfo { tx_rnti: 1, dst_l2_id: dst, harq_process_id: id, ack: true }
    }

    #[test]
    fn test_fifth_assignment_fails() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        let ids: Vec<u8> = (0..4).map(|_| harq.assign(10).unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(matches!(harq.assign(10), Err(LayerError::HarqProcessUnavailable(10))));
        assert!(matches!(harq.assign(11), Err(LayerError::UnknownDestination(11))));
    }

    #[test]
    fn test_assignment_never_returns_busy_process() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        let first = harq.assign(10).unwrap();
        let second = harq.assign(10).unwrap();
        assert_ne!(first, second);
        assert!(!harq.is_available(10, first));
        harq.add_packet(10, 4, first, Bytes::from_static(b"tb")).unwrap();
        assert!(harq.recv_feedback(&ack(10, first)));
        assert!(harq.is_available(10, first));
        assert!(harq.packet_burst(10, first).is_none());
        assert_eq!(harq.num_available(10), 3);
    }

    #[test]
    fn test_duplicate_destination() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        assert!(harq.add_dst(10).is_err());
    }

    #[test]
    fn test_add_packet_only_on_busy_process() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        harq.add_packet(10, 4, 0, Bytes::from_static(b"x")).unwrap();
        assert!(harq.packet_burst(10, 0).is_none());

        let id = harq.allocate(10, false, 100).unwrap();
        harq.add_packet(10, 4, id, Bytes::from_static(b"a")).unwrap();
        harq.add_packet(10, 5, id, Bytes::from_static(b"b")).unwrap();
        assert_eq!(harq.packet_burst(10, id).unwrap().len(), 2);
        assert_eq!(harq.lcid_count(10, id), 2);
        assert!(harq.add_packet(10, 5, id, Bytes::from_static(b"c")).is_err());
        assert_eq!(harq.lcid_count(10, id), harq.packet_burst(10, id).unwrap().len());
    }

    #[test]
    fn test_multiple_pdu_limit() {
        let mut harq = NrSlUeMacHarq::new(4, 1).unwrap();
        harq.add_dst(10).unwrap();
        assert!(harq.allocate(10, true, 100).is_some());
        assert!(harq.allocate(10, true, 100).is_none());
        assert!(harq.allocate(10, false, 100).is_some());
    }

    #[test]
    fn test_feedback_on_multiple_pdu_flushes() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        let id = harq.allocate(10, true, 1000).unwrap();
        harq.add_packet(10, 4, id, Bytes::from_static(b"a")).unwrap();
        let nack = SlHarqInfo { ack: false, ..ack(10, id) };
        assert!(!harq.recv_feedback(&nack));
        assert!(harq.recv_feedback(&ack(10, id)));
        assert!(!harq.is_available(10, id));
        assert!(harq.packet_burst(10, id).unwrap().is_empty());
        assert!(!harq.recv_feedback(&ack(10, id)));
    }

    #[test]
    fn test_expire() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        let single = harq.allocate(10, false, 50).unwrap();
        let multiple = harq.allocate(10, true, 50).unwrap();
        harq.add_packet(10, 4, multiple, Bytes::from_static(b"a")).unwrap();
        assert!(harq.expire(49).is_empty());
        let expired = harq.expire(50);
        assert_eq!(expired, vec![(10, single), (10, multiple)]);
        assert!(harq.is_available(10, single));
        assert!(!harq.is_available(10, multiple));
        assert!(harq.packet_burst(10, multiple).unwrap().is_empty());
        assert!(harq.expire(60).is_empty());
    }

    #[test]
    fn test_renew_timer() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        assert!(!harq.renew_timer(10, 0, 100));
        let id = harq.allocate(10, false, 50).unwrap();
        assert!(harq.renew_timer(10, id, 100));
        assert!(harq.expire(60).is_empty());
        assert_eq!(harq.expire(100), vec![(10, id)]);
    }

    #[test]
    fn test_update_harq_process() {
        let mut harq = NrSlUeMacHarq::new(4, 2).unwrap();
        harq.add_dst(10).unwrap();
        let id = harq.allocate(10, false, 50).unwrap();
        harq.update_harq_process(10, id, 3, true, 120);
        assert_eq!(harq.harq_process_info(10, id), Some((3, true, 120)));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(NrSlUeMacHarq::new(0, 0).is_err());
        assert!(NrSlUeMacHarq::new(4, 5).is_err());
        assert!(NrSlUeMacHarq::new(33, 1).is_err());
    }
}
