//! Sidelink Transport Block Size Calculation
//!
//! Implements the TBS determination of 3GPP TS 38.214 Section 5.1.3.2 for
//! PSSCH using MCS index table 1 (64QAM).

use crate::LayerError;
use tracing::trace;

/// Highest MCS index of table 1
pub const MAX_MCS: u8 = 28;

/// Subcarriers per resource block
const SUBCARRIERS_PER_RB: u32 = 12;

/// Reference (DMRS) subcarriers accounted per RB symbol
const REF_SUBCARRIERS_PER_RB: u32 = 1;

/// TS 38.214 Table 5.1.3.1-1: (modulation order, target code rate x 1024)
const MCS_TABLE_1: [(u8, u16); 29] = [
    (2, 120), (2, 157), (2, 193), (2, 251), (2, 308), (2, 379), (2, 449), (2, 526),
    (2, 602), (2, 679), (4, 340), (4, 378), (4, 434), (4, 490), (4, 553), (4, 616),
    (4, 658), (6, 438), (6, 466), (6, 517), (6, 567), (6, 616), (6, 666), (6, 719),
    (6, 772), (6, 822), (6, 873), (6, 910), (6, 948),
];

/// TS 38.214 Table 5.1.3.2-1: TBS for N_info <= 3824
const TBS_TABLE: [u32; 93] = [
    24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168, 176,
    184, 192, 208, 224, 240, 256, 272, 288, 304, 320, 336, 352, 368, 384, 408, 432, 456, 480,
    504, 528, 552, 576, 608, 640, 672, 704, 736, 768, 808, 848, 888, 928, 984, 1032, 1064,
    1128, 1160, 1192, 1224, 1256, 1288, 1320, 1352, 1416, 1480, 1544, 1608, 1672, 1736, 1800,
    1864, 1928, 2024, 2088, 2152, 2216, 2280, 2408, 2472, 2536, 2600, 2664, 2728, 2792, 2856,
    2976, 3104, 3240, 3368, 3496, 3624, 3752, 3824,
];

/// Adaptive modulation and coding helper for the sidelink shared channel
#[derive(Debug, Clone, Copy, Default)]
pub struct NrSlAmc;

impl NrSlAmc {
    pub fn new() -> Self {
        Self
    }

    /// Modulation order of an MCS index
    pub fn modulation_order(mcs: u8) -> Result<u8, LayerError> {
        Self::mcs_entry(mcs).map(|(qm, _)| qm)
    }

    /// Transport block size in bytes for `rb_symbols` RB x symbol units
    pub fn calculate_tb_size(&self, mcs: u8, rank: u8, rb_symbols: u32) -> Result<u32, LayerError> {
        if rank == 0 {
            return Err(LayerError::InvalidConfiguration("Rank must be at least 1".to_string()));
        }
        let (qm, rate) = Self::mcs_entry(mcs)?;
        let n_re = rb_symbols * (SUBCARRIERS_PER_RB - REF_SUBCARRIERS_PER_RB);
        let code_rate = rate as f64 / 1024.0;
        let n_info = n_re as f64 * code_rate * qm as f64 * rank as f64;
        let tbs_bits = Self::tbs_bits(n_info, code_rate);
        trace!(
            "MCS {} rank {} rb_symbols {} N_info {:.1} TBS {} bits",
            mcs,
            rank,
            rb_symbols,
            n_info,
            tbs_bits
        );
        Ok(tbs_bits / 8)
    }

    fn mcs_entry(mcs: u8) -> Result<(u8, u16), LayerError> {
        MCS_TABLE_1.get(mcs as usize).copied().ok_or_else(|| {
            LayerError::InvalidConfiguration(format!("MCS {} while maximum MCS is {}", mcs, MAX_MCS))
        })
    }

    fn tbs_bits(n_info: f64, code_rate: f64) -> u32 {
        if n_info <= 3824.0 {
            let n = ((n_info.max(1.0)).log2().floor() as i32 - 6).max(3);
            let step = 2f64.powi(n);
            let n_info_q = (step * (n_info / step).floor()).max(24.0) as u32;
            TBS_TABLE
                .iter()
                .copied()
                .find(|&tbs| tbs >= n_info_q)
                .unwrap_or(TBS_TABLE[TBS_TABLE.len() - 1])
        } else {
            let n = (n_info - 24.0).log2().floor() as i32 - 5;
            let step = 2f64.powi(n);
            let n_info_q = (step * ((n_info - 24.0) / step).round()).max(3840.0);
            let c = if code_rate <= 0.25 {
                ((n_info_q + 24.0) / 3816.0).ceil()
            } else if n_info_q > 8424.0 {
                ((n_info_q + 24.0) / 8424.0).ceil()
            } else {
                1.0
            };
            (8.0 * c * ((n_info_q + 24.0) / (8.0 * c)).ceil() - 24.0) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_tb() {
        let amc = NrSlAmc::new();
        assert_eq!(amc.calculate_tb_size(0, 1, 1).unwrap(), 3);
    }

    #[test]
    fn test_small_tbs_from_table() {
        // 10 RBs x 9 symbols, MCS 14: N_info = 990 * 553/1024 * 4 = 2138.5
        let amc = NrSlAmc::new();
        assert_eq!(amc.calculate_tb_size(14, 1, 90).unwrap(), 2152 / 8);
    }

    #[test]
    fn test_large_tbs_formula() {
        // 50 RBs x 12 symbols, MCS 28: N_info = 6600 * 948/1024 * 6 = 36660.9
        // n = 10, N'_info = 36864, C = 5, TBS = 36896
        let amc = NrSlAmc::new();
        assert_eq!(amc.calculate_tb_size(28, 1, 600).unwrap(), 36896 / 8);
    }

    #[test]
    fn test_tb_size_grows_with_resources() {
        let amc = NrSlAmc::new();
        let mut prev = 0;
        for subch in 1..=10 {
            let tbs = amc.calculate_tb_size(14, 1, subch * 10 * 9).unwrap();
            assert!(tbs >= prev);
            prev = tbs;
        }
    }

    #[test]
    fn test_invalid_mcs() {
        let amc = NrSlAmc::new();
        assert!(amc.calculate_tb_size(29, 1, 10).is_err());
        assert!(amc.calculate_tb_size(5, 0, 10).is_err());
        assert_eq!(NrSlAmc::modulation_order(17).unwrap(), 6);
    }
}
