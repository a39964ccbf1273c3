//! Slot Clock
//!
//! System frame number / subframe / slot identifier used by every sidelink
//! scheduling decision (frame structure of 3GPP TS 38.211 Section 4.3).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Number of subframes in one radio frame
pub const SUBFRAMES_PER_FRAME: u32 = 10;

/// Highest supported numerology (240 kHz)
pub const MAX_NUMEROLOGY: u8 = 5;

/// Errors raised when building or comparing slot identifiers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfnSfError {
    #[error("Invalid numerology: {0}")]
    InvalidNumerology(u8),

    #[error("Invalid subframe: {0}")]
    InvalidSubframe(u8),

    #[error("Invalid slot {slot} for numerology {numerology}")]
    InvalidSlot { slot: u8, numerology: u8 },

    #[error("Cannot compare slots of numerology {0} and {1}")]
    NumerologyMismatch(u8, u8),
}

/// Slot identifier (frame, subframe, slot) at a given numerology.
///
/// Ordering is only defined between values sharing the same numerology:
/// `partial_cmp` yields `None` otherwise, so `<`/`>` are both false.
/// Use [`SfnSf::try_cmp`] when a mismatch must be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SfnSf {
    /// System frame number
    frame: u32,
    /// Subframe within the frame (0-9)
    subframe: u8,
    /// Slot within the subframe
    slot: u8,
    /// Numerology (mu), slots per subframe = 2^mu
    numerology: u8,
}

impl SfnSf {
    /// Create a new slot identifier with range validation
    pub fn new(frame: u32, subframe: u8, slot: u8, numerology: u8) -> Result<Self, SfnSfError> {
        if numerology > MAX_NUMEROLOGY {
            return Err(SfnSfError::InvalidNumerology(numerology));
        }
        if subframe as u32 >= SUBFRAMES_PER_FRAME {
            return Err(SfnSfError::InvalidSubframe(subframe));
        }
        if slot as u32 >= (1u32 << numerology) {
            return Err(SfnSfError::InvalidSlot { slot, numerology });
        }
        Ok(Self { frame, subframe, slot, numerology })
    }

    /// Build the slot identifier from a flat slot index
    pub fn from_normalized(index: u64, numerology: u8) -> Result<Self, SfnSfError> {
        let mut sfn = Self::new(0, 0, 0, numerology)?;
        sfn.add(index);
        Ok(sfn)
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn subframe(&self) -> u8 {
        self.subframe
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn numerology(&self) -> u8 {
        self.numerology
    }

    /// Slots per subframe (2^mu)
    pub fn slots_per_subframe(&self) -> u32 {
        1u32 << self.numerology
    }

    /// Slots per 10 ms frame
    pub fn slots_per_frame(&self) -> u32 {
        self.slots_per_subframe() * SUBFRAMES_PER_FRAME
    }

    /// Slot duration in microseconds
    pub fn slot_duration_us(&self) -> u32 {
        1000 >> self.numerology
    }

    /// Flat, monotonically increasing slot index
    pub fn normalize(&self) -> u64 {
        let spsf = self.slots_per_subframe() as u64;
        self.slot as u64
            + self.subframe as u64 * spsf
            + self.frame as u64 * SUBFRAMES_PER_FRAME as u64 * spsf
    }

    /// Advance by `slots` physical slots
    pub fn add(&mut self, slots: u64) {
        let spsf = self.slots_per_subframe() as u64;
        let total_slots = self.slot as u64 + slots;
        let subframes = self.subframe as u64 + total_slots / spsf;
        self.frame = (self.frame as u64 + subframes / SUBFRAMES_PER_FRAME as u64) as u32;
        self.subframe = (subframes % SUBFRAMES_PER_FRAME as u64) as u8;
        self.slot = (total_slots % spsf) as u8;
    }

    /// Slot identifier `slots` physical slots later
    pub fn future(&self, slots: u64) -> SfnSf {
        let mut sfn = *self;
        sfn.add(slots);
        sfn
    }

    /// Ordering that reports a numerology mismatch instead of hiding it
    pub fn try_cmp(&self, other: &SfnSf) -> Result<Ordering, SfnSfError> {
        if self.numerology != other.numerology {
            return Err(SfnSfError::NumerologyMismatch(self.numerology, other.numerology));
        }
        Ok(self.normalize().cmp(&other.normalize()))
    }

    /// Key usable in ordered maps and sets
    pub fn key(&self) -> SlotKey {
        SlotKey { numerology: self.numerology, index: self.normalize() }
    }

    /// Pack into 64 bits: frame(32) | subframe(8) | slot(8) | numerology(8) | reserved(8)
    pub fn encode(&self) -> u64 {
        ((self.frame as u64) << 32)
            | ((self.subframe as u64) << 24)
            | ((self.slot as u64) << 16)
            | ((self.numerology as u64) << 8)
    }

    /// Inverse of [`SfnSf::encode`]
    pub fn decode(value: u64) -> Result<Self, SfnSfError> {
        let frame = (value >> 32) as u32;
        let subframe = ((value >> 24) & 0xFF) as u8;
        let slot = ((value >> 16) & 0xFF) as u8;
        let numerology = ((value >> 8) & 0xFF) as u8;
        Self::new(frame, subframe, slot, numerology)
    }
}

/// Total-order key for slot-indexed collections.
///
/// Keys sort by numerology first, then by normalized slot index, so two
/// slots only compare as equal when they denote the same physical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub numerology: u8,
    pub index: u64,
}

impl From<SfnSf> for SlotKey {
    fn from(sfn: SfnSf) -> Self {
        sfn.key()
    }
}

impl PartialOrd for SfnSf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_cmp(other).ok()
    }
}

impl fmt::Display for SfnSf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} (mu={})", self.frame, self.subframe, self.slot, self.numerology)
    }
}
