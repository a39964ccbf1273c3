//! Candidate Resource Generation
//!
//! Implements the sidelink UE autonomous resource selection procedure of
//! 3GPP TS 38.214 Section 8.1.4: the candidate single-slot resource set S_A
//! and the sensing-based exclusion of steps 5 to 7.

use crate::LayerError;
use common::SfnSf;
use std::collections::BTreeSet;
use tracing::{debug, trace};

use super::phy_mac_common::{
    NrSlTransmissionParams, ReservedResource, SensingData, SensingTraceReport, SlResourceInfo,
    NO_VALUE,
};
use super::resource_pool::{SlResourcePool, SlotInfo};

/// Step 7 raises the RSRP threshold by this amount per iteration
const RSRP_THRESHOLD_STEP_DB: i32 = 3;
/// Highest RSRP threshold, reaching it means nothing can be selected
const MAX_RSRP_THRESHOLD_DBM: i32 = 0;

/// Selection window and sensing parameters of the MAC
#[derive(Debug, Clone, PartialEq)]
pub struct SensingConfig {
    /// Sensing-based selection enabled
    pub enable_sensing: bool,
    /// Start of the selection window in slots
    pub t1: u8,
    /// End of the selection window in slots
    pub t2: u16,
    /// Tproc0 in slots
    pub tproc0: u8,
    /// Initial RSRP threshold in dBm
    pub thres_rsrp: i32,
    /// Minimum share of M_total that must survive exclusion, in percent
    pub resource_percentage: u8,
    /// MAC processing gap after a PSFCH, in slots
    pub min_time_gap_processing: u8,
}

/// Result of one candidate query
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSelection {
    /// Remaining candidates, in slot order
    pub resources: Vec<SlResourceInfo>,
    /// Algorithm trace
    pub report: SensingTraceReport,
}

/// Stateless generator of candidate single-slot resources
#[derive(Debug, Clone)]
pub struct CandidateResourceGenerator {
    config: SensingConfig,
}

impl CandidateResourceGenerator {
    pub fn new(config: SensingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SensingConfig {
        &self.config
    }

    /// T2 to use for a query (R1-2003807)
    ///
    /// With a packet delay budget the window ends at min(T2, PDB), otherwise
    /// at max(T2, T2min).
    pub fn effective_t2(&self, sfn: &SfnSf, pdb_ms: u32, pool: &dyn SlResourcePool) -> u16 {
        if pdb_ms != 0 {
            let t2_pdb = time_to_slots(sfn, pdb_ms);
            if t2_pdb > self.config.t2 {
                debug!("Using T2 value from configuration {} less than packet delay budget {}", self.config.t2, t2_pdb);
                self.config.t2
            } else {
                debug!("Using T2 value from packet delay budget: {}", t2_pdb);
                t2_pdb
            }
        } else {
            let t2_min = pool.t2_min(sfn.numerology());
            if self.config.t2 < t2_min {
                debug!("Using T2min value {}", t2_min);
                t2_min
            } else {
                self.config.t2
            }
        }
    }

    /// Candidate resources for a transmission decided at `sfn`
    pub fn candidates(
        &self,
        sfn: &SfnSf,
        params: &NrSlTransmissionParams,
        pool: &dyn SlResourcePool,
        sensing_data: &[SensingData],
        transmit_history: &[SfnSf],
    ) -> Result<CandidateSelection, LayerError> {
        let t1 = self.config.t1;
        let t2 = self.effective_t2(sfn, params.pdb_ms, pool);
        let numerology = sfn.numerology();

        if !check_t1_within_tproc1(numerology, t1 as u16) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Configured T1 {} is greater than Tproc1 for numerology {}",
                t1, numerology
            )));
        }
        if t2 < t1 as u16 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Selection window end T2 {} is before T1 {}",
                t2, t1
            )));
        }

        // (T2 - T1 + 1) slots expressed in ms
        let window_ms = ((t2 - t1 as u16 + 1) as u32) >> numerology;
        if params.rri_ms != 0 && window_ms > params.rri_ms as u32 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Selection window of {} ms exceeds the reservation period of {} ms; \
                 adjust T1, T2, numerology or reservation period",
                window_ms, params.rri_ms
            )));
        }

        let total_subch = pool.total_subchannels();
        let mut report = SensingTraceReport {
            sfn: *sfn,
            t0: pool.sensing_window_slots(numerology),
            tproc0: self.config.tproc0,
            t1,
            t2,
            subchannels: total_subch,
            l_subch: params.l_subch,
            resource_percentage: self.config.resource_percentage,
            initial_candidate_slots_size: 0,
            initial_candidate_resources_size: 0,
            candidate_resources_size_after_step5: 0,
            initial_rsrp_threshold: self.config.thres_rsrp,
            final_rsrp_threshold: self.config.thres_rsrp,
        };

        // Step 4: candidate single slots
        let slots = pool.opportunities(sfn.normalize(), numerology, t1 as u16, t2);
        report.initial_candidate_slots_size = slots.len() as u16;
        if slots.is_empty() {
            debug!("No sidelink slots in the selection window [{}, {}] from {}", t1, t2, sfn);
            return Ok(CandidateSelection { resources: Vec::new(), report });
        }

        let candidates = self.resources_from_slots(sfn, pool, params.l_subch, total_subch, &slots);
        let m_total = candidates.len();
        report.initial_candidate_resources_size = m_total as u16;
        report.candidate_resources_size_after_step5 = m_total as u16;

        if !self.config.enable_sensing {
            debug!("No sensing: total resources selected {}", m_total);
            return Ok(CandidateSelection { resources: candidates, report });
        }
        if sensing_data.is_empty() && transmit_history.is_empty() {
            debug!("No sensing data or transmit history: total resources selected {}", m_total);
            trace!("Sensing report: {:?}", report);
            return Ok(CandidateSelection { resources: candidates, report });
        }

        // Keep [n - T0, n - Tproc0) of both buffers, latest entries are at the back
        let now = sfn.normalize();
        let tproc0 = self.config.tproc0 as u64;
        let mut sensed = sensing_data.to_vec();
        while sensed.last().is_some_and(|d| now.saturating_sub(d.sfn.normalize()) <= tproc0) {
            sensed.pop();
        }
        let mut history = transmit_history.to_vec();
        while history.last().is_some_and(|h| now.saturating_sub(h.normalize()) <= tproc0) {
            history.pop();
        }

        let min_remaining = self.config.resource_percentage as f64 / 100.0 * m_total as f64;

        // Step 5: own transmissions cannot be sensed, exclude their projections
        let mut after_step5 = candidates.clone();
        exclude_resources_based_on_history(sfn, &history, &mut after_step5, pool.reserve_period_list());
        if (after_step5.len() as f64) < min_remaining {
            debug!(
                "Step 5a fails, too few remaining candidates: original {} updated {}",
                m_total,
                after_step5.len()
            );
            after_step5 = candidates;
        }
        report.candidate_resources_size_after_step5 = after_step5.len() as u16;

        // Step 6: project every sensed SCI into the selection window
        let projections: Vec<Vec<ReservedResource>> = sensed
            .iter()
            .map(|data| {
                let resv_period_slots = pool.reservation_period_in_slots(data.rsvp, numerology);
                project_reserved_resources(data, sfn.slot_duration_us(), resv_period_slots, t1 as u16, t2)
            })
            .collect();

        let p_prime_rsvp_tx = pool.reservation_period_in_slots(params.rri_ms, numerology) as u64;
        let mut rsrp_threshold = self.config.thres_rsrp;
        let mut remaining;
        loop {
            remaining = after_step5
                .iter()
                .filter(|candidate| {
                    !is_reserved(candidate, &projections, rsrp_threshold, params.c_resel, p_prime_rsvp_tx)
                })
                .cloned()
                .collect::<Vec<_>>();
            debug!("Step 6 kept {} resources with threshold {} dBm", remaining.len(), rsrp_threshold);

            // Step 7
            rsrp_threshold += RSRP_THRESHOLD_STEP_DB;
            if rsrp_threshold > MAX_RSRP_THRESHOLD_DBM {
                debug!("Reached maximum RSRP threshold, unable to select resources");
                remaining.clear();
                break;
            }
            if remaining.len() as f64 >= min_remaining {
                break;
            }
        }

        report.final_rsrp_threshold = rsrp_threshold - RSRP_THRESHOLD_STEP_DB;
        debug!("{} resources selected after sensing from {} candidates", remaining.len(), m_total);
        trace!("Sensing report: {:?}", report);
        Ok(CandidateSelection { resources: remaining, report })
    }

    /// Expand each slot into every contiguous window of `l_subch` subchannels
    fn resources_from_slots(
        &self,
        sfn: &SfnSf,
        pool: &dyn SlResourcePool,
        l_subch: u16,
        total_subch: u16,
        slots: &[SlotInfo],
    ) -> Vec<SlResourceInfo> {
        let mut resources = Vec::new();
        for slot in slots {
            let mut start = 0u16;
            while start + l_subch <= total_subch {
                resources.push(SlResourceInfo {
                    num_sl_pscch_rbs: slot.num_sl_pscch_rbs,
                    sl_pscch_sym_start: slot.sl_pscch_sym_start,
                    sl_pscch_sym_length: slot.sl_pscch_sym_length,
                    sl_pssch_sym_start: slot.sl_pssch_sym_start,
                    sl_pssch_sym_length: slot.sl_pssch_sym_length,
                    sl_subchannel_size: slot.sl_subchannel_size,
                    sl_max_num_per_reserve: slot.sl_max_num_per_reserve,
                    sl_psfch_period: pool.psfch_period(),
                    sl_min_time_gap_psfch: pool.min_time_gap_psfch(),
                    sl_min_time_gap_processing: self.config.min_time_gap_processing,
                    sfn: sfn.future(slot.slot_offset),
                    sl_subchannel_start: start as u8,
                    sl_subchannel_length: l_subch as u8,
                });
                start += 1;
            }
        }
        resources
    }
}

/// Whether any of the `c_resel` repetitions of a candidate collides with a
/// projected reservation above the threshold
fn is_reserved(
    candidate: &SlResourceInfo,
    projections: &[Vec<ReservedResource>],
    rsrp_threshold: i32,
    c_resel: u16,
    p_prime_rsvp_tx: u64,
) -> bool {
    for projection in projections {
        for i in 0..c_resel as u64 {
            let slot = candidate.sfn.future(i * p_prime_rsvp_tx).normalize();
            for reserved in projection {
                if reserved.sfn.normalize() == slot
                    && reserved.sl_rsrp > rsrp_threshold as f64
                    && overlapped_resource(
                        reserved.sb_ch_start,
                        reserved.sb_ch_length,
                        candidate.sl_subchannel_start,
                        candidate.sl_subchannel_length,
                    )
                {
                    debug!(
                        "Resource {}:[{}, {}] erased, RSRP {} above threshold {}",
                        candidate.sfn.normalize(),
                        candidate.sl_subchannel_start,
                        candidate.sl_subchannel_start as u16 + candidate.sl_subchannel_length as u16 - 1,
                        reserved.sl_rsrp,
                        rsrp_threshold
                    );
                    return true;
                }
            }
        }
    }
    false
}

/// T1 must not exceed Tproc1 (TS 38.214 Table 8.1.4-2)
pub fn check_t1_within_tproc1(numerology: u8, t1_slots: u16) -> bool {
    match numerology {
        0 => t1_slots <= 3,
        1 => t1_slots <= 5,
        2 => t1_slots <= 9,
        3 => t1_slots <= 17,
        _ => false,
    }
}

/// Convert a duration in ms to slots of the numerology of `sfn`
pub fn time_to_slots(sfn: &SfnSf, ms: u32) -> u16 {
    let us = ms as u64 * 1000;
    ((us << sfn.numerology()) / 1000) as u16
}

/// Whether two subchannel ranges overlap
pub fn overlapped_resource(first_start: u8, first_length: u8, second_start: u8, second_length: u8) -> bool {
    let first_end = first_start as u16 + first_length as u16;
    let second_end = second_start as u16 + second_length as u16;
    (first_start.max(second_start) as u16) < first_end.min(second_end)
}

/// Step 5: drop candidates in slots that a past transmission would reserve
/// for any period of the pool's reservation period list
pub fn exclude_resources_based_on_history(
    sfn: &SfnSf,
    transmit_history: &[SfnSf],
    candidates: &mut Vec<SlResourceInfo>,
    reserve_period_list: &[u16],
) {
    let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
        return;
    };
    let first_norm = first.sfn.normalize();
    let last_norm = last.sfn.normalize();
    debug!("Excluding resources between normalized slots ({}:{})", first_norm, last_norm);

    let mut to_exclude = BTreeSet::new();
    for period_ms in reserve_period_list.iter().filter(|p| **p != 0) {
        let period = (*period_ms as u64) << sfn.numerology();
        for past in transmit_history {
            let mut check = past.normalize() + period;
            while check <= last_norm {
                if check >= first_norm {
                    to_exclude.insert(check);
                }
                check += period;
            }
        }
    }
    candidates.retain(|c| !to_exclude.contains(&c.sfn.normalize()));
}

/// Step 6c: future reservations of a sensed SCI inside the selection window.
///
/// Q = ceil(T_scal / P_rsvp_rx) when the period is shorter than T_scal,
/// 1 otherwise and 0 for a one-shot reservation. Each projection also
/// carries the signalled retransmissions.
pub fn project_reserved_resources(
    sensed: &SensingData,
    slot_duration_us: u32,
    resv_period_slots: u16,
    t1: u16,
    t2: u16,
) -> Vec<ReservedResource> {
    let slot_ms = slot_duration_us as f64 / 1000.0;
    let window_slots = (t2 - t1 + 1) as f64;
    let t_scal_ms = window_slots * slot_ms;
    let p_rsvp_ms = sensed.rsvp as f64;
    let q = if sensed.rsvp == 0 {
        0
    } else if p_rsvp_ms < t_scal_ms {
        (t_scal_ms / p_rsvp_ms).ceil() as u64
    } else {
        1
    };

    let mut projected = Vec::new();
    for i in 1..=q {
        let base = ReservedResource {
            sfn: sensed.sfn.future(i * resv_period_slots as u64),
            rsvp: sensed.rsvp,
            sb_ch_length: sensed.sb_ch_length,
            sb_ch_start: sensed.sb_ch_start,
            prio: sensed.prio,
            sl_rsrp: sensed.sl_rsrp,
        };
        projected.push(base.clone());
        if sensed.gap_re_tx1 != NO_VALUE {
            projected.push(ReservedResource {
                sfn: base.sfn.future(sensed.gap_re_tx1 as u64),
                sb_ch_start: sensed.sb_ch_start_re_tx1,
                ..base.clone()
            });
        }
        if sensed.gap_re_tx2 != NO_VALUE {
            projected.push(ReservedResource {
                sfn: base.sfn.future(sensed.gap_re_tx2 as u64),
                sb_ch_start: sensed.sb_ch_start_re_tx2,
                ..base
            });
        }
    }
    trace!("q: {}, projected reservations: {}", q, projected.len());
    projected
}

/// Drop sensing records older than the sensing window
pub fn remove_old_sensing_data(sfn: &SfnSf, sensing_window: u16, sensing_data: &mut Vec<SensingData>) {
    let oldest = sfn.normalize().saturating_sub(sensing_window as u64);
    let before = sensing_data.len();
    sensing_data.retain(|d| d.sfn.normalize() >= oldest);
    if before != sensing_data.len() {
        trace!("Dropped {} sensing records older than {}", before - sensing_data.len(), oldest);
    }
}

/// Drop own transmissions older than the sensing window
pub fn remove_old_transmit_history(sfn: &SfnSf, sensing_window: u16, history: &mut Vec<SfnSf>) {
    let oldest = sfn.normalize().saturating_sub(sensing_window as u64);
    history.retain(|h| h.normalize() >= oldest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::sidelink::resource_pool::{BitmapResourcePool, SlPoolConfig};

    fn sensing_config(enable_sensing: bool) -> SensingConfig {
        SensingConfig {
            enable_sensing,
            t1: 2,
            t2: 33,
            tproc0: 1,
            thres_rsrp: -128,
            resource_percentage: 20,
            min_time_gap_processing: 2,
        }
    }

    fn params(l_subch: u16, rri_ms: u16, c_resel: u16) -> NrSlTransmissionParams {
        NrSlTransmissionParams { priority: 1, pdb_ms: 0, l_subch, rri_ms, c_resel }
    }

    fn pool() -> BitmapResourcePool {
        BitmapResourcePool::new(SlPoolConfig::default()).unwrap()
    }

    fn slot(index: u64) -> SfnSf {
        SfnSf::from_normalized(index, 0).unwrap()
    }

    #[test]
    fn test_empty_pool_returns_no_candidates() {
        let pool = BitmapResourcePool::new(SlPoolConfig { bitmap: vec![0; 10], ..Default::default() }).unwrap();
        let generator = CandidateResourceGenerator::new(sensing_config(false));
        let sel = generator.candidates(&slot(1000), &params(1, 100, 10), &pool, &[], &[]).unwrap();
        assert!(sel.resources.is_empty());
        assert_eq!(sel.report.initial_candidate_slots_size, 0);
    }

    #[test]
    fn test_sliding_window_expansion() {
        let generator = CandidateResourceGenerator::new(sensing_config(false));
        let sel = generator.candidates(&slot(1000), &params(2, 100, 10), &pool(), &[], &[]).unwrap();
        // 32 slots, 5 subchannels, windows of 2 give 4 per slot
        assert_eq!(sel.resources.len(), 32 * 4);
        assert_eq!(sel.resources[0].sfn.normalize(), 1002);
        assert_eq!(sel.resources[3].sl_subchannel_start, 3);
        assert!(sel.resources.windows(2).all(|w| w[0].sfn.normalize() <= w[1].sfn.normalize()));
    }

    #[test]
    fn test_candidates_are_idempotent() {
        let generator = CandidateResourceGenerator::new(sensing_config(true));
        let sensed = vec![SensingData::new(slot(950), 100, 1, 0, 1, -60.0)];
        let history = vec![slot(960)];
        let a = generator.candidates(&slot(1000), &params(1, 100, 10), &pool(), &sensed, &history).unwrap();
        let b = generator.candidates(&slot(1000), &params(1, 100, 10), &pool(), &sensed, &history).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_t1_beyond_tproc1_is_rejected() {
        let mut config = sensing_config(false);
        config.t1 = 4;
        let generator = CandidateResourceGenerator::new(config);
        assert!(generator.candidates(&slot(0), &params(1, 100, 10), &pool(), &[], &[]).is_err());
    }

    #[test]
    fn test_window_longer_than_rri_is_rejected() {
        let generator = CandidateResourceGenerator::new(sensing_config(false));
        assert!(generator.candidates(&slot(0), &params(1, 20, 10), &pool(), &[], &[]).is_err());
        assert!(generator.candidates(&slot(0), &params(1, 0, 1), &pool(), &[], &[]).is_ok());
    }

    #[test]
    fn test_effective_t2() {
        let generator = CandidateResourceGenerator::new(sensing_config(false));
        let pool = pool();
        assert_eq!(generator.effective_t2(&slot(0), 20, &pool), 20);
        assert_eq!(generator.effective_t2(&slot(0), 50, &pool), 33);
        assert_eq!(generator.effective_t2(&slot(0), 0, &pool), 33);
        let mut config = sensing_config(false);
        config.t2 = 3;
        assert_eq!(CandidateResourceGenerator::new(config).effective_t2(&slot(0), 0, &pool), 5);
    }

    #[test]
    fn test_step6_excludes_strong_reservation() {
        let generator = CandidateResourceGenerator::new(sensing_config(true));
        // Sensed at 920 with 100 ms period, projected to 1020 on subchannel 0
        let sensed = vec![SensingData::new(slot(920), 100, 1, 0, 1, -60.0)];
        let sel = generator.candidates(&slot(1000), &params(1, 100, 1), &pool(), &sensed, &[]).unwrap();
        assert_eq!(sel.resources.len(), 32 * 5 - 1);
        assert!(!sel
            .resources
            .iter()
            .any(|r| r.sfn.normalize() == 1020 && r.sl_subchannel_start == 0));
        assert_eq!(sel.report.final_rsrp_threshold, -128);
    }

    #[test]
    fn test_step7_raises_threshold() {
        let mut config = sensing_config(true);
        config.resource_percentage = 100;
        let generator = CandidateResourceGenerator::new(config);
        let sensed = vec![SensingData::new(slot(920), 100, 1, 0, 1, -100.0)];
        let sel = generator.candidates(&slot(1000), &params(1, 100, 1), &pool(), &sensed, &[]).unwrap();
        assert_eq!(sel.resources.len(), 32 * 5);
        // Thresholds -128 up to -101 still exclude the -100 dBm reservation
        assert_eq!(sel.report.final_rsrp_threshold, -98);
    }

    #[test]
    fn test_step7_gives_up_above_zero_dbm() {
        let mut config = sensing_config(true);
        config.resource_percentage = 100;
        let generator = CandidateResourceGenerator::new(config);
        let sensed = vec![SensingData::new(slot(920), 100, 5, 0, 1, 10.0)];
        let sel = generator.candidates(&slot(1000), &params(1, 100, 1), &pool(), &sensed, &[]).unwrap();
        assert!(sel.resources.is_empty());
    }

    #[test]
    fn test_exclude_resources_based_on_history() {
        let generator = CandidateResourceGenerator::new(sensing_config(false));
        let mut candidates = generator
            .candidates(&slot(1000), &params(1, 100, 1), &pool(), &[], &[])
            .unwrap()
            .resources;
        exclude_resources_based_on_history(&slot(1000), &[slot(905)], &mut candidates, &[0, 100]);
        assert_eq!(candidates.len(), 31 * 5);
        assert!(!candidates.iter().any(|c| c.sfn.normalize() == 1005));
    }

    #[test]
    fn test_project_reserved_resources_with_retransmissions() {
        let sensed = SensingData::new(slot(900), 100, 2, 1, 3, -80.0).with_re_tx1(3, 2).with_re_tx2(5, 0);
        let projected = project_reserved_resources(&sensed, 1000, 100, 2, 33);
        assert_eq!(projected.len(), 3);
        let slots: Vec<u64> = projected.iter().map(|r| r.sfn.normalize()).collect();
        assert_eq!(slots, vec![1000, 1003, 1005]);
        assert_eq!(projected[0].sb_ch_start, 1);
        assert_eq!(projected[1].sb_ch_start, 2);
        assert_eq!(projected[2].sb_ch_start, 0);
    }

    #[test]
    fn test_q_for_short_period() {
        // 32 ms window and a 20 ms period gives Q = 2
        let sensed = SensingData::new(slot(900), 20, 1, 0, 1, -80.0);
        assert_eq!(project_reserved_resources(&sensed, 1000, 20, 2, 33).len(), 2);
        let one_shot = SensingData::new(slot(900), 0, 1, 0, 1, -80.0);
        assert!(project_reserved_resources(&one_shot, 1000, 0, 2, 33).is_empty());
    }

    #[test]
    fn test_overlapped_resource() {
        assert!(overlapped_resource(0, 2, 1, 1));
        assert!(!overlapped_resource(0, 2, 2, 1));
        assert!(overlapped_resource(3, 1, 0, 5));
    }

    #[test]
    fn test_remove_old_data() {
        let mut data = vec![
            SensingData::new(slot(850), 100, 1, 0, 1, -90.0),
            SensingData::new(slot(950), 100, 1, 0, 1, -90.0),
        ];
        remove_old_sensing_data(&slot(1000), 100, &mut data);
        assert_eq!(data.len(), 1);
        let mut history = vec![slot(899), slot(900), slot(990)];
        remove_old_transmit_history(&slot(1000), 100, &mut history);
        assert_eq!(history, vec![slot(900), slot(990)]);
    }

    #[test]
    fn test_tproc1_limits() {
        assert!(check_t1_within_tproc1(0, 3));
        assert!(!check_t1_within_tproc1(0, 4));
        assert!(check_t1_within_tproc1(3, 17));
        assert!(!check_t1_within_tproc1(4, 1));
    }
}
