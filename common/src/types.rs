//! Common Types for the Sidelink UE
//!
//! Defines fundamental types shared by the sidelink protocol stack

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};

/// Sidelink layer 2 identifier (24 bits, TS 38.300 Section 16.9.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct L2Id(pub u32);

impl L2Id {
    /// Mask of the significant 24 bits
    pub const MASK: u32 = 0x00FF_FFFF;

    /// Create a new L2 id, truncated to 24 bits
    pub fn new(value: u32) -> Self {
        Self(value & Self::MASK)
    }

    /// Get the L2 id value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// 8 least significant bits, carried in SCI stage 2
    pub fn lsb8(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// 16 least significant bits, carried in SCI stage 2
    pub fn lsb16(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology (mu) of this spacing
    pub fn numerology(&self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }

    /// Spacing for a numerology, if supported
    pub fn from_numerology(numerology: u8) -> Option<Self> {
        match numerology {
            0 => Some(SubcarrierSpacing::Scs15),
            1 => Some(SubcarrierSpacing::Scs30),
            2 => Some(SubcarrierSpacing::Scs60),
            3 => Some(SubcarrierSpacing::Scs120),
            4 => Some(SubcarrierSpacing::Scs240),
            _ => None,
        }
    }

    /// Spacing in kHz
    pub fn khz(&self) -> u16 {
        num_traits::ToPrimitive::to_u16(self).unwrap_or(15)
    }
}

/// Sidelink cast type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastType {
    #[default]
    Unicast = 0,
    Groupcast = 1,
    Broadcast = 2,
}

impl CastType {
    /// Wire value used in SCI stage 2
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Decode a wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        num_traits::FromPrimitive::from_u8(value)
    }
}
