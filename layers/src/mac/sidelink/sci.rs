//! Sidelink Control Information
//!
//! SCI format 1-A (carried on PSCCH) and SCI format 2-A (carried on PSSCH)
//! according to 3GPP TS 38.212 Sections 8.3.1.1 and 8.4.1.1.

use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::types::CastType;
use nom::{
    combinator::cond,
    number::complete::{be_u16, be_u32, be_u8},
    sequence::tuple,
    IResult,
};
use tracing::trace;

use super::phy_mac_common::NO_VALUE;

/// SCI stage 2 formats announced in SCI 1-A
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SciStage2Format {
    #[default]
    Format2A = 0,
    Format2B = 1,
}

/// SCI format 1-A
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SciStage1A {
    pub priority: u8,
    pub mcs: u8,
    pub stage2_format: SciStage2Format,
    /// Resource reservation period in ms
    pub sl_resource_reserve_period: u16,
    pub total_subchannels: u16,
    pub index_start_subchannel: u8,
    pub length_subchannel: u8,
    pub sl_max_num_per_reserve: u8,
    gap_re_tx1: u8,
    index_start_subchannel_re_tx1: u8,
    gap_re_tx2: u8,
    index_start_subchannel_re_tx2: u8,
}

impl SciStage1A {
    pub fn new(
        priority: u8,
        mcs: u8,
        sl_resource_reserve_period: u16,
        total_subchannels: u16,
        index_start_subchannel: u8,
        length_subchannel: u8,
        sl_max_num_per_reserve: u8,
    ) -> Self {
        Self {
            priority,
            mcs,
            stage2_format: SciStage2Format::Format2A,
            sl_resource_reserve_period,
            total_subchannels,
            index_start_subchannel,
            length_subchannel,
            sl_max_num_per_reserve,
            gap_re_tx1: NO_VALUE,
            index_start_subchannel_re_tx1: NO_VALUE,
            gap_re_tx2: NO_VALUE,
            index_start_subchannel_re_tx2: NO_VALUE,
        }
    }

    /// Announce the first retransmission; needs `sl_max_num_per_reserve >= 2`
    pub fn set_re_tx1(&mut self, gap: u8, start_subchannel: u8) -> Result<(), LayerError> {
        if self.sl_max_num_per_reserve < 2 {
            return Err(LayerError::InvalidState(format!(
                "SlMaxNumPerReserve {} does not allow a first retransmission",
                self.sl_max_num_per_reserve
            )));
        }
        self.gap_re_tx1 = gap;
        self.index_start_subchannel_re_tx1 = start_subchannel;
        Ok(())
    }

    /// Announce the second retransmission; needs `sl_max_num_per_reserve == 3`
    pub fn set_re_tx2(&mut self, gap: u8, start_subchannel: u8) -> Result<(), LayerError> {
        if self.sl_max_num_per_reserve != 3 {
            return Err(LayerError::InvalidState(format!(
                "SlMaxNumPerReserve {} does not allow a second retransmission",
                self.sl_max_num_per_reserve
            )));
        }
        if gap == self.gap_re_tx1 {
            return Err(LayerError::InvalidState(
                "Second retransmission must use a different slot than the first".to_string(),
            ));
        }
        self.gap_re_tx2 = gap;
        self.index_start_subchannel_re_tx2 = start_subchannel;
        Ok(())
    }

    pub fn gap_re_tx1(&self) -> u8 {
        self.gap_re_tx1
    }

    pub fn index_start_subchannel_re_tx1(&self) -> u8 {
        self.index_start_subchannel_re_tx1
    }

    pub fn gap_re_tx2(&self) -> u8 {
        self.gap_re_tx2
    }

    pub fn index_start_subchannel_re_tx2(&self) -> u8 {
        self.index_start_subchannel_re_tx2
    }

    /// Encoded length in bytes
    pub fn serialized_size(&self) -> usize {
        let mut size = 10;
        if self.sl_max_num_per_reserve >= 2 {
            size += 2;
        }
        if self.sl_max_num_per_reserve == 3 {
            size += 2;
        }
        size
    }

    fn validate(&self) -> Result<(), LayerError> {
        if !(1..=3).contains(&self.sl_max_num_per_reserve) {
            return Err(LayerError::InvalidState(format!(
                "Invalid value {} for SlMaxNumPerReserve. Only 1, 2, or 3 should be used",
                self.sl_max_num_per_reserve
            )));
        }
        if self.total_subchannels == 0 || self.length_subchannel == 0 {
            return Err(LayerError::InvalidState("Sub-channel fields must be set".to_string()));
        }
        Ok(())
    }

    /// Encode to bytes
    pub fn encode(&self) -> Result<Bytes, LayerError> {
        self.validate()?;
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        buf.put_u8(self.priority);
        buf.put_u8(self.mcs);
        buf.put_u8(self.stage2_format as u8);
        buf.put_u16(self.sl_resource_reserve_period);
        buf.put_u16(self.total_subchannels);
        buf.put_u8(self.index_start_subchannel);
        buf.put_u8(self.length_subchannel);
        buf.put_u8(self.sl_max_num_per_reserve);
        if self.sl_max_num_per_reserve >= 2 {
            buf.put_u8(self.gap_re_tx1);
            buf.put_u8(self.index_start_subchannel_re_tx1);
        }
        if self.sl_max_num_per_reserve == 3 {
            buf.put_u8(self.gap_re_tx2);
            buf.put_u8(self.index_start_subchannel_re_tx2);
        }
        trace!("Encoded SCI 1-A: {} bytes", buf.len());
        Ok(buf.freeze())
    }

    /// Decode from bytes
    pub fn decode(data: &[u8]) -> Result<Self, LayerError> {
        let (_, sci) = parse_sci_1a(data).map_err(|_| LayerError::InvalidPdu)?;
        sci.validate()?;
        Ok(sci)
    }
}

fn parse_sci_1a(input: &[u8]) -> IResult<&[u8], SciStage1A> {
    let (input, (priority, mcs, format, period, total, start, length, max_reserve)) =
        tuple((be_u8, be_u8, be_u8, be_u16, be_u16, be_u8, be_u8, be_u8))(input)?;
    let (input, re_tx1) = cond(max_reserve >= 2, tuple((be_u8, be_u8)))(input)?;
    let (input, re_tx2) = cond(max_reserve == 3, tuple((be_u8, be_u8)))(input)?;

    let mut sci = SciStage1A::new(priority, mcs, period, total, start, length, max_reserve);
    sci.stage2_format = if format == 1 { SciStage2Format::Format2B } else { SciStage2Format::Format2A };
    if let Some((gap, start)) = re_tx1 {
        sci.gap_re_tx1 = gap;
        sci.index_start_subchannel_re_tx1 = start;
    }
    if let Some((gap, start)) = re_tx2 {
        sci.gap_re_tx2 = gap;
        sci.index_start_subchannel_re_tx2 = start;
    }
    Ok((input, sci))
}

/// SCI format 2-A
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SciStage2A {
    /// 5 bits
    pub harq_id: u8,
    pub ndi: u8,
    /// 2 bits
    pub rv: u8,
    /// 8 LSB of the source L2 id
    pub src_id: u8,
    /// 16 LSB of the destination L2 id
    pub dst_id: u16,
    pub csi_req: u8,
    /// 12 bits
    pub zone_id: u16,
    /// 4 bits
    pub comm_range: u8,
    pub cast_type: CastType,
    pub harq_feedback_indicator: bool,
}

impl SciStage2A {
    pub const SERIALIZED_SIZE: usize = 10;

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_SIZE);
        let seg1 = ((self.harq_id as u32 & 0x1F) << 27)
            | ((self.ndi as u32 & 0x1) << 26)
            | ((self.rv as u32 & 0x3) << 24)
            | ((self.src_id as u32) << 16)
            | self.dst_id as u32;
        let seg2 = ((self.csi_req as u32 & 0x1) << 31)
            | ((self.zone_id as u32 & 0xFFF) << 19)
            | ((self.comm_range as u32 & 0xF) << 15);
        buf.put_u32(seg1);
        buf.put_u32(seg2);
        buf.put_u8(self.cast_type.as_u8());
        buf.put_u8(self.harq_feedback_indicator as u8);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(data: &[u8]) -> Result<Self, LayerError> {
        let (_, (seg1, seg2, cast, feedback)) =
            tuple((be_u32, be_u32, be_u8, be_u8))(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| {
                LayerError::InvalidPdu
            })?;
        let cast_type = CastType::from_u8(cast).ok_or(LayerError::InvalidPdu)?;
        Ok(Self {
            harq_id: ((seg1 >> 27) & 0x1F) as u8,
            ndi: ((seg1 >> 26) & 0x1) as u8,
            rv: ((seg1 >> 24) & 0x3) as u8,
            src_id: ((seg1 >> 16) & 0xFF) as u8,
            dst_id: (seg1 & 0xFFFF) as u16,
            csi_req: ((seg2 >> 31) & 0x1) as u8,
            zone_id: ((seg2 >> 19) & 0xFFF) as u16,
            comm_range: ((seg2 >> 15) & 0xF) as u8,
            cast_type,
            harq_feedback_indicator: feedback != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sci_1a_with_retransmissions() {
        let mut sci = SciStage1A::new(1, 14, 100, 5, 0, 2, 3);
        sci.set_re_tx1(4, 1).unwrap();
        sci.set_re_tx2(9, 3).unwrap();
        let encoded = sci.encode().unwrap();
        assert_eq!(encoded.len(), 14);
        assert_eq!(&encoded[3..5], &[0x00, 0x64]);
        let decoded = SciStage1A::decode(&encoded).unwrap();
        assert_eq!(decoded, sci);
        assert_eq!(decoded.gap_re_tx2(), 9);
    }

    #[test]
    fn test_sci_1a_gap_rejected_above_max_per_reserve() {
        let mut sci = SciStage1A::new(1, 14, 0, 5, 0, 1, 1);
        assert!(sci.set_re_tx1(2, 0).is_err());
        let mut sci = SciStage1A::new(1, 14, 0, 5, 0, 1, 2);
        sci.set_re_tx1(2, 0).unwrap();
        assert!(sci.set_re_tx2(3, 0).is_err());
        let mut sci = SciStage1A::new(1, 14, 0, 5, 0, 1, 3);
        sci.set_re_tx1(2, 0).unwrap();
        assert!(sci.set_re_tx2(2, 0).is_err());
    }

    #[test]
    fn test_sci_1a_unreserved_gap() {
        let sci = SciStage1A::new(1, 14, 0, 5, 0, 1, 2);
        let decoded = SciStage1A::decode(&sci.encode().unwrap()).unwrap();
        assert_eq!(decoded.gap_re_tx1(), NO_VALUE);
        assert_eq!(SciStage1A::new(1, 14, 0, 5, 0, 1, 1).encode().unwrap().len(), 10);
        assert!(SciStage1A::new(1, 14, 0, 5, 0, 0, 1).encode().is_err());
    }

    #[test]
    fn test_sci_1a_truncated() {
        let mut sci = SciStage1A::new(1, 14, 0, 5, 0, 1, 2);
        sci.set_re_tx1(2, 0).unwrap();
        let encoded = sci.encode().unwrap();
        assert!(matches!(SciStage1A::decode(&encoded[..11]), Err(LayerError::InvalidPdu)));
    }

    #[test]
    fn test_sci_2a_bit_layout() {
        let sci = SciStage2A {
            harq_id: 31,
            ndi: 1,
            rv: 2,
            src_id: 0xAB,
            dst_id: 0x1234,
            csi_req: 1,
            zone_id: 0xFFF,
            comm_range: 0x5,
            cast_type: CastType::Groupcast,
            harq_feedback_indicator: true,
        };
        let encoded = sci.encode();
        assert_eq!(encoded.len(), SciStage2A::SERIALIZED_SIZE);
        assert_eq!(&encoded[..4], &[0xFE, 0xAB, 0x12, 0x34]);
        assert_eq!(SciStage2A::decode(&encoded).unwrap(), sci);
        assert!(SciStage2A::decode(&encoded[..9]).is_err());
    }
}
