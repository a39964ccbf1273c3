//! Radio Link Control (RLC) Layer Implementation
//!
//! Sidelink RLC in unacknowledged mode (3GPP TS 38.322 Section 5.2.2), one
//! entity per (source, destination, LCID). SDUs are segmented only when the
//! head of the queue does not fit the transmit opportunity.

use crate::mac::sidelink::{NrSlMacSapUser, NrSlReportBufferStatus, NrSlRlcPdu, NrSlTxOpportunity, SidelinkLcIdentifier};
use crate::mac::MAC_SUBHEADER_SIZE;
use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// UMD PDU header with a 6-bit SN
pub const RLC_HEADER_SIZE: usize = 1;

const SN_MODULUS: u8 = 64;

/// Segmentation info field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentInfo {
    /// Complete SDU
    Full = 0b00,
    First = 0b01,
    Last = 0b10,
    Middle = 0b11,
}

impl SegmentInfo {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Full,
            0b01 => Self::First,
            0b10 => Self::Last,
            _ => Self::Middle,
        }
    }
}

/// RLC PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlcPduHeader {
    pub si: SegmentInfo,
    /// Sequence number shared by all segments of one SDU
    pub sn: u8,
}

impl RlcPduHeader {
    fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RLC_HEADER_SIZE + payload.len());
        buf.put_u8(((self.si as u8) << 6) | (self.sn % SN_MODULUS));
        buf.put_slice(payload);
        buf.freeze()
    }

    fn decode(pdu: &Bytes) -> Result<(Self, Bytes), LayerError> {
        let first = *pdu.first().ok_or(LayerError::InvalidPdu)?;
        let header = Self { si: SegmentInfo::from_bits(first >> 6), sn: first & (SN_MODULUS - 1) };
        Ok((header, pdu.slice(RLC_HEADER_SIZE..)))
    }
}

/// Queued SDU and the slot it arrived in
#[derive(Debug, Clone)]
struct QueuedSdu {
    data: Bytes,
    /// Bytes already sent as earlier segments
    offset: usize,
    sn: u8,
    arrival_slot: u64,
}

impl QueuedSdu {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Counters of one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlRlcStats {
    pub tx_sdus: u64,
    pub tx_pdus: u64,
    pub tx_bytes: u64,
    pub rx_sdus: u64,
    pub rx_bytes: u64,
    /// Segments dropped for an SN mismatch
    pub rx_discarded: u64,
}

/// UM entity of one sidelink logical channel
#[derive(Debug, Clone)]
pub struct SlRlcEntity {
    id: SidelinkLcIdentifier,
    rnti: u16,
    queue: VecDeque<QueuedSdu>,
    next_sn: u8,
    max_queue_bytes: usize,
    /// Partially received SDU: SN and bytes so far
    reassembly: Option<(u8, BytesMut)>,
    stats: SlRlcStats,
}

impl SlRlcEntity {
    pub fn new(id: SidelinkLcIdentifier, rnti: u16, max_queue_bytes: usize) -> Self {
        Self {
            id,
            rnti,
            queue: VecDeque::new(),
            next_sn: 0,
            max_queue_bytes,
            reassembly: None,
            stats: SlRlcStats::default(),
        }
    }

    pub fn id(&self) -> SidelinkLcIdentifier {
        self.id
    }

    pub fn stats(&self) -> &SlRlcStats {
        &self.stats
    }

    /// Bytes waiting for transmission, headers included
    pub fn tx_queue_size(&self) -> u32 {
        self.queue.iter().map(|s| (s.remaining() + RLC_HEADER_SIZE) as u32).sum()
    }

    /// Queue an SDU arrived at `slot`
    pub fn enqueue(&mut self, sdu: Bytes, slot: u64) -> Result<(), LayerError> {
        if sdu.is_empty() {
            return Err(LayerError::InvalidPdu);
        }
        let queued: usize = self.queue.iter().map(QueuedSdu::remaining).sum();
        if queued + sdu.len() > self.max_queue_bytes {
            warn!("RLC queue of LC {} to {} full, dropping SDU", self.id.lcid, self.id.dst_l2_id);
            return Err(LayerError::ResourceUnavailable);
        }
        self.queue.push_back(QueuedSdu { data: sdu, offset: 0, sn: self.next_sn, arrival_slot: slot });
        self.next_sn = (self.next_sn + 1) % SN_MODULUS;
        Ok(())
    }

    /// Buffer status report at `slot`
    pub fn buffer_status(&self, slot: u64) -> NrSlReportBufferStatus {
        let hol = self.queue.front().map_or(0, |s| slot.saturating_sub(s.arrival_slot));
        NrSlReportBufferStatus {
            rnti: self.rnti,
            lcid: self.id.lcid,
            src_l2_id: self.id.src_l2_id,
            dst_l2_id: self.id.dst_l2_id,
            tx_queue_size: self.tx_queue_size(),
            tx_queue_hol_delay: u16::try_from(hol).unwrap_or(u16::MAX),
            ..Default::default()
        }
    }

    /// Build PDUs for an opportunity of `bytes`.
    ///
    /// The first PDU may use the whole opportunity, every further PDU also
    /// pays for its own MAC subheader.
    pub fn tx_opportunity(&mut self, bytes: u32) -> Vec<Bytes> {
        let mut budget = bytes as usize;
        let mut pdus = Vec::new();
        while let Some(head) = self.queue.front_mut() {
            let overhead = RLC_HEADER_SIZE + if pdus.is_empty() { 0 } else { MAC_SUBHEADER_SIZE };
            if budget <= overhead {
                break;
            }
            let room = budget - overhead;
            let remaining = head.remaining();
            if remaining > room && !pdus.is_empty() {
                break;
            }
            let take = remaining.min(room);
            let si = match (head.offset == 0, take == remaining) {
                (true, true) => SegmentInfo::Full,
                (true, false) => SegmentInfo::First,
                (false, true) => SegmentInfo::Last,
                (false, false) => SegmentInfo::Middle,
            };
            let header = RlcPduHeader { si, sn: head.sn };
            let pdu = header.encode(&head.data[head.offset..head.offset + take]);
            trace!("LC {} PDU SN {} {:?}: {} bytes", self.id.lcid, head.sn, si, pdu.len());
            head.offset += take;
            budget -= overhead + take;
            self.stats.tx_pdus += 1;
            self.stats.tx_bytes += pdu.len() as u64;
            pdus.push(pdu);
            if head.remaining() == 0 {
                self.queue.pop_front();
                self.stats.tx_sdus += 1;
            } else {
                break;
            }
        }
        pdus
    }

    /// Process a received PDU, returning a completed SDU
    pub fn receive(&mut self, pdu: &Bytes) -> Result<Option<Bytes>, LayerError> {
        let (header, payload) = RlcPduHeader::decode(pdu)?;
        self.stats.rx_bytes += pdu.len() as u64;
        let sdu = match header.si {
            SegmentInfo::Full => Some(payload),
            SegmentInfo::First => {
                if self.reassembly.is_some() {
                    self.stats.rx_discarded += 1;
                }
                self.reassembly = Some((header.sn, BytesMut::from(&payload[..])));
                None
            }
            SegmentInfo::Middle | SegmentInfo::Last => match self.reassembly.take() {
                Some((sn, mut buf)) if sn == header.sn => {
                    buf.put_slice(&payload);
                    if header.si == SegmentInfo::Last {
                        Some(buf.freeze())
                    } else {
                        self.reassembly = Some((sn, buf));
                        None
                    }
                }
                _ => {
                    debug!("Discarding segment SN {} of LC {}", header.sn, self.id.lcid);
                    self.stats.rx_discarded += 1;
                    None
                }
            },
        };
        if sdu.is_some() {
            self.stats.rx_sdus += 1;
        }
        Ok(sdu)
    }
}

/// All RLC entities of a UE, serving the MAC
#[derive(Debug, Clone)]
pub struct SlRlcSet {
    rnti: u16,
    max_queue_bytes: usize,
    entities: BTreeMap<SidelinkLcIdentifier, SlRlcEntity>,
    /// Entities whose queue changed since the last report
    dirty: Vec<SidelinkLcIdentifier>,
    delivered: Vec<(SidelinkLcIdentifier, Bytes)>,
}

impl SlRlcSet {
    pub fn new(rnti: u16, max_queue_bytes: usize) -> Self {
        Self { rnti, max_queue_bytes, entities: BTreeMap::new(), dirty: Vec::new(), delivered: Vec::new() }
    }

    /// Create the entity of an LC; existing entities are kept
    pub fn add_entity(&mut self, id: SidelinkLcIdentifier) {
        let (rnti, max) = (self.rnti, self.max_queue_bytes);
        self.entities.entry(id).or_insert_with(|| SlRlcEntity::new(id, rnti, max));
    }

    pub fn remove_entity(&mut self, id: &SidelinkLcIdentifier) -> Option<SlRlcEntity> {
        self.dirty.retain(|d| d != id);
        self.entities.remove(id)
    }

    pub fn entity(&self, id: &SidelinkLcIdentifier) -> Option<&SlRlcEntity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &SlRlcEntity> {
        self.entities.values()
    }

    /// Queue an SDU from upper layers
    pub fn enqueue(&mut self, id: &SidelinkLcIdentifier, sdu: Bytes, slot: u64) -> Result<(), LayerError> {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or(LayerError::UnknownLogicalChannel { dst: id.dst_l2_id, lcid: id.lcid })?;
        entity.enqueue(sdu, slot)?;
        if !self.dirty.contains(id) {
            self.dirty.push(*id);
        }
        Ok(())
    }

    /// Buffer status of every entity whose queue changed
    pub fn take_buffer_reports(&mut self, slot: u64) -> Vec<NrSlReportBufferStatus> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .iter()
            .filter_map(|id| self.entities.get(id))
            .map(|e| e.buffer_status(slot))
            .collect()
    }

    /// SDUs delivered to upper layers since the last call
    pub fn take_delivered(&mut self) -> Vec<(SidelinkLcIdentifier, Bytes)> {
        std::mem::take(&mut self.delivered)
    }
}

impl NrSlMacSapUser for SlRlcSet {
    fn notify_tx_opportunity(&mut self, opportunity: &NrSlTxOpportunity) -> Vec<NrSlRlcPdu> {
        let id = SidelinkLcIdentifier::new(opportunity.src_l2_id, opportunity.dst_l2_id, opportunity.lcid);
        let Some(entity) = self.entities.get_mut(&id) else {
            warn!("TX opportunity for unknown LC {} to {}", opportunity.lcid, opportunity.dst_l2_id);
            return Vec::new();
        };
        let pdus = entity.tx_opportunity(opportunity.bytes);
        if !entity.queue.is_empty() && !self.dirty.contains(&id) {
            self.dirty.push(id);
        }
        pdus.into_iter()
            .map(|pdu| NrSlRlcPdu {
                pdu,
                rnti: opportunity.rnti,
                lcid: opportunity.lcid,
                harq_id: opportunity.harq_id,
                src_l2_id: opportunity.src_l2_id,
                dst_l2_id: opportunity.dst_l2_id,
            })
            .collect()
    }

    fn receive_rlc_pdu(&mut self, pdu: NrSlRlcPdu) {
        let id = SidelinkLcIdentifier::new(pdu.src_l2_id, pdu.dst_l2_id, pdu.lcid);
        let (rnti, max) = (self.rnti, self.max_queue_bytes);
        let entity = self.entities.entry(id).or_insert_with(|| {
            debug!("Creating RX RLC entity for LC {} from {} to {}", id.lcid, id.src_l2_id, id.dst_l2_id);
            SlRlcEntity::new(id, rnti, max)
        });
        match entity.receive(&pdu.pdu) {
            Ok(Some(sdu)) => self.delivered.push((id, sdu)),
            Ok(None) => {}
            Err(e) => warn!("Dropping RLC PDU of LC {}: {}", id.lcid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> SidelinkLcIdentifier {
        SidelinkLcIdentifier::new(1, 10, 4)
    }

    #[test]
    fn test_whole_sdus_fit() {
        let mut entity = SlRlcEntity::new(id(), 1, 10_000);
        entity.enqueue(Bytes::from(vec![1; 50]), 0).unwrap();
        entity.enqueue(Bytes::from(vec![2; 40]), 2).unwrap();
        assert_eq!(entity.tx_queue_size(), 92);
        let status = entity.buffer_status(5);
        assert_eq!((status.lcid, status.tx_queue_size, status.tx_queue_hol_delay), (4, 92, 5));

        let pdus = entity.tx_opportunity(200);
        assert_eq!(pdus.len(), 2);
        assert_eq!(pdus[0].len(), 51);
        assert_eq!(pdus[1][0], 1);
        assert_eq!(entity.tx_queue_size(), 0);
        assert_eq!(entity.stats().tx_sdus, 2);
    }

    #[test]
    fn test_head_segmentation_and_reassembly() {
        let mut tx = SlRlcEntity::new(id(), 1, 10_000);
        let sdu = Bytes::from((0..250u8).collect::<Vec<_>>());
        tx.enqueue(sdu.clone(), 0).unwrap();
        let mut rx = SlRlcEntity::new(id(), 2, 10_000);

        let mut out = None;
        for _ in 0..3 {
            let pdus = tx.tx_opportunity(101);
            assert_eq!(pdus.len(), 1);
            assert!(pdus[0].len() <= 101);
            if let Some(done) = rx.receive(&pdus[0]).unwrap() {
                out = Some(done);
            }
        }
        assert_eq!(out, Some(sdu));
        assert_eq!(tx.tx_queue_size(), 0);
        assert_eq!(rx.stats().rx_sdus, 1);
    }

    #[test]
    fn test_second_sdu_not_segmented() {
        let mut entity = SlRlcEntity::new(id(), 1, 10_000);
        entity.enqueue(Bytes::from(vec![1; 30]), 0).unwrap();
        entity.enqueue(Bytes::from(vec![2; 100]), 0).unwrap();
        let pdus = entity.tx_opportunity(80);
        assert_eq!(pdus.len(), 1);
        assert_eq!(entity.tx_queue_size(), 101);
    }

    #[test]
    fn test_orphan_segment_discarded() {
        let mut rx = SlRlcEntity::new(id(), 1, 10_000);
        let last = RlcPduHeader { si: SegmentInfo::Last, sn: 3 }.encode(b"tail");
        assert_eq!(rx.receive(&last).unwrap(), None);
        assert_eq!(rx.stats().rx_discarded, 1);
        assert!(rx.receive(&Bytes::new()).is_err());
    }

    #[test]
    fn test_queue_limit() {
        let mut entity = SlRlcEntity::new(id(), 1, 100);
        entity.enqueue(Bytes::from(vec![0; 80]), 0).unwrap();
        assert_eq!(entity.enqueue(Bytes::from(vec![0; 30]), 0), Err(LayerError::ResourceUnavailable));
        assert_eq!(entity.enqueue(Bytes::new(), 0), Err(LayerError::InvalidPdu));
    }

    #[test]
    fn test_rlc_set_serves_mac() {
        let mut set = SlRlcSet::new(1, 10_000);
        assert!(set.enqueue(&id(), Bytes::from_static(b"x"), 0).is_err());
        set.add_entity(id());
        set.enqueue(&id(), Bytes::from(vec![7; 300]), 0).unwrap();
        let reports = set.take_buffer_reports(0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tx_queue_size, 301);
        assert!(set.take_buffer_reports(0).is_empty());

        let opportunity =
            NrSlTxOpportunity { bytes: 200, rnti: 1, lcid: 4, harq_id: 2, src_l2_id: 1, dst_l2_id: 10 };
        let pdus = set.notify_tx_opportunity(&opportunity);
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].harq_id, 2);
        // The rest of the segmented SDU is reported again
        assert_eq!(set.take_buffer_reports(1)[0].tx_queue_size, 102);

        let mut peer = SlRlcSet::new(2, 10_000);
        for pdu in pdus.into_iter().chain(set.notify_tx_opportunity(&opportunity)) {
            peer.receive_rlc_pdu(pdu);
        }
        let delivered = peer.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, id());
        assert_eq!(delivered[0].1.len(), 300);
    }
}
