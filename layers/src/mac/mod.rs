//! Medium Access Control (MAC) Layer Implementation
//!
//! Implements the NR sidelink UE MAC according to 3GPP TS 38.321

pub mod sidelink;

use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u8},
    IResult,
};
use tracing::trace;

/// Largest LCID addressable by the 6-bit LCID field
pub const MAX_LCID: u8 = 63;

/// Size of a MAC subheader with a 16-bit length field
pub const MAC_SUBHEADER_SIZE: usize = 3;

/// MAC subheader structure (R/F/LCID/L, TS 38.321 Section 6.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacSubheader {
    /// Logical channel ID
    pub lcid: u8,
    /// Length field
    pub length: u16,
}

/// MAC Service Data Unit (SDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacSdu {
    /// Subheader
    pub subheader: MacSubheader,
    /// Payload data
    pub data: Bytes,
}

impl MacSdu {
    pub fn new(lcid: u8, data: Bytes) -> Result<Self, LayerError> {
        if lcid > MAX_LCID {
            return Err(LayerError::InvalidPdu);
        }
        let length = u16::try_from(data.len()).map_err(|_| LayerError::InvalidPdu)?;
        Ok(Self { subheader: MacSubheader { lcid, length }, data })
    }

    /// Encoded length including the subheader
    pub fn encoded_len(&self) -> usize {
        MAC_SUBHEADER_SIZE + self.data.len()
    }
}

/// Multiplex SDUs into one buffer of MAC subPDUs.
///
/// Every subheader carries F=1 and a 16-bit length.
pub fn encode_sub_pdus(sdus: &[MacSdu]) -> Bytes {
    let mut buf = BytesMut::with_capacity(sdus.iter().map(MacSdu::encoded_len).sum());
    for sdu in sdus {
        buf.put_u8(0x40 | (sdu.subheader.lcid & MAX_LCID));
        buf.put_u16(sdu.subheader.length);
        buf.put_slice(&sdu.data);
    }
    trace!("Encoded {} MAC subPDUs into {} bytes", sdus.len(), buf.len());
    buf.freeze()
}

/// Split a buffer of MAC subPDUs back into SDUs
pub fn decode_sub_pdus(data: &Bytes) -> Result<Vec<MacSdu>, LayerError> {
    let mut sdus = Vec::new();
    let mut input: &[u8] = data;
    while !input.is_empty() {
        let offset = data.len() - input.len();
        let (rest, (subheader, payload_len)) = parse_sub_pdu(input).map_err(|_| LayerError::InvalidPdu)?;
        let start = offset + (input.len() - rest.len()) - payload_len;
        sdus.push(MacSdu { subheader, data: data.slice(start..start + payload_len) });
        input = rest;
    }
    Ok(sdus)
}

fn parse_sub_pdu(input: &[u8]) -> IResult<&[u8], (MacSubheader, usize)> {
    let (input, first) = be_u8(input)?;
    let (input, length) = if first & 0x40 != 0 {
        be_u16(input)?
    } else {
        let (input, length) = be_u8(input)?;
        (input, length as u16)
    };
    let (input, payload) = take(length as usize)(input)?;
    Ok((input, (MacSubheader { lcid: first & MAX_LCID, length }, payload.len())))
}
