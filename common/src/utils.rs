//! Common Utilities
//!
//! Provides helpers used across the sidelink UE implementation

use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}


/// Time utilities for slot/frame calculations
pub mod time {
    use super::trace;

    /// Slot duration in microseconds for a numerology
    pub fn slot_duration_us(numerology: u8) -> u32 {
        1000 >> numerology
    }

    /// Convert a duration in milliseconds to physical slots
    pub fn ms_to_slots(ms: u32, numerology: u8) -> u32 {
        let slots = ms << numerology;
        trace!("{} ms = {} slots at numerology {}", ms, slots, numerology);
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_slot_duration() {
        assert_eq!(time::slot_duration_us(0), 1000);
        assert_eq!(time::slot_duration_us(1), 500);
        assert_eq!(time::slot_duration_us(3), 125);
    }

    #[test]
    fn test_ms_to_slots() {
        assert_eq!(time::ms_to_slots(100, 0), 100);
        assert_eq!(time::ms_to_slots(100, 2), 400);
    }
}
